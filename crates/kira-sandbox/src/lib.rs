#![deny(missing_docs)]

//! **kira-sandbox** – Subprocess isolation for plugins.
//!
//! Each plugin runs in its own OS process with a stdin/stdout JSON-RPC 2.0
//! channel framed with `Content-Length` headers. Plugins get no direct view
//! of the vault filesystem: every vault operation goes through the
//! `vault.*` RPC surface (see [`vault_rpc`]) and is policy-checked.
//!
//! Launching prepares a sanitized environment (whitelisted variables only,
//! proxy-blackhole hints when networking is denied) and, on Unix, applies
//! resource limits in the child before exec: address-space cap, CPU cap
//! derived from the execution timeout, and no core dumps. Crashing plugins
//! are restart-rate-limited; past the threshold the plugin is disabled and
//! `plugin.failed` is emitted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{info, warn};

use kira_bus_core::EventBus;
use kira_policy::Policy;
use kira_types::events;

pub mod manifest;
pub mod rpc;
pub mod vault_rpc;

pub use manifest::{load_manifest, parse_manifest, PluginManifest, MANIFEST_FILE};
pub use rpc::{read_frame, write_frame, FrameError, RpcRequest, RpcResponse};
pub use vault_rpc::VaultRpcHandler;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by the sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The manifest failed schema validation.
    #[error("invalid plugin manifest: {0}")]
    InvalidManifest(String),
    /// The manifest file could not be read.
    #[error("failed to read manifest {path}: {source}")]
    ManifestIo {
        /// Manifest path.
        path: PathBuf,
        /// OS-level error.
        #[source]
        source: std::io::Error,
    },
    /// Restart budget exhausted; the plugin is disabled.
    #[error("plugin {plugin} exceeded restart limit ({max_restarts} restarts in {window:?})")]
    RestartLimitExceeded {
        /// Offending plugin.
        plugin: String,
        /// Allowed restarts inside the window.
        max_restarts: u32,
        /// Rate-limit window.
        window: Duration,
    },
    /// Process could not be spawned.
    #[error("failed to launch plugin {plugin}: {source}")]
    Launch {
        /// Offending plugin.
        plugin: String,
        /// OS-level error.
        #[source]
        source: std::io::Error,
    },
    /// No running process for the plugin.
    #[error("plugin not running: {0}")]
    NotRunning(String),
    /// RPC framing failure.
    #[error(transparent)]
    Rpc(#[from] FrameError),
    /// The plugin did not answer within its timeout.
    #[error("plugin {plugin} timed out after {timeout:?}")]
    Timeout {
        /// Offending plugin.
        plugin: String,
        /// Configured timeout.
        timeout: Duration,
    },
}

//─────────────────────────────
//  Options
//─────────────────────────────

/// Runtime knobs for the sandbox manager.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Per-request execution timeout.
    pub timeout: Duration,
    /// Restarts allowed inside the window before the plugin is disabled.
    pub max_restarts: u32,
    /// Restart rate-limit window.
    pub restart_window: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Environment variables forwarded into the child.
    pub env_whitelist: Vec<String>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_restarts: 3,
            restart_window: Duration::from_secs(300),
            grace_period: Duration::from_secs(5),
            env_whitelist: vec!["PATH".into(), "HOME".into(), "USER".into(), "LANG".into()],
        }
    }
}

//─────────────────────────────
//  Environment sanitization
//─────────────────────────────

/// Build the child environment: only whitelisted variables survive, and
/// when networking is denied, proxy variables point at a blackhole as a
/// best-effort hint on top of the policy enforcement.
pub fn prepare_environment(policy: &Policy, whitelist: &[String]) -> HashMap<String, String> {
    let base: HashMap<String, String> = std::env::vars().collect();
    prepare_environment_from(policy, whitelist, &base)
}

fn prepare_environment_from(
    policy: &Policy,
    whitelist: &[String],
    base: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for var in whitelist {
        if let Some(value) = base.get(var) {
            env.insert(var.clone(), value.clone());
        }
    }

    if policy.check_network_access().is_err() {
        env.insert("http_proxy".into(), "http://0.0.0.0:0".into());
        env.insert("https_proxy".into(), "http://0.0.0.0:0".into());
        env.insert("no_proxy".into(), "*".into());
    }

    env
}

#[cfg(unix)]
fn apply_resource_limits(command: &mut Command, policy: &Policy) {
    let memory_limit = policy.sandbox.memory_limit_mb;
    let cpu_seconds = policy.sandbox.timeout_ms / 1000 + 10;

    // Runs in the child between fork and exec; only async-signal-safe
    // calls are allowed here.
    unsafe {
        command.pre_exec(move || {
            if let Some(limit_mb) = memory_limit {
                let bytes = limit_mb * 1024 * 1024;
                let rlim = libc::rlimit { rlim_cur: bytes, rlim_max: bytes };
                libc::setrlimit(libc::RLIMIT_AS, &rlim);
            }

            let no_core = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
            libc::setrlimit(libc::RLIMIT_CORE, &no_core);

            let cpu = libc::rlimit { rlim_cur: cpu_seconds, rlim_max: cpu_seconds + 5 };
            libc::setrlimit(libc::RLIMIT_CPU, &cpu);

            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_resource_limits(_command: &mut Command, _policy: &Policy) {}

//─────────────────────────────
//  Plugin process
//─────────────────────────────

/// A running plugin subprocess and its RPC channel.
pub struct PluginProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// Plugin identifier.
    pub plugin_name: String,
    /// Enforcement policy attached at launch.
    pub policy: Policy,
    options: SandboxOptions,
    started_at: Instant,
    next_request_id: u64,
}

impl PluginProcess {
    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Uptime since launch.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Send a request and await the matching response frame, bounded by the
    /// sandbox timeout.
    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value, SandboxError> {
        self.next_request_id += 1;
        let id = self.next_request_id;
        let request = serde_json::to_value(RpcRequest::new(id, method, params))
            .expect("request serializes");

        write_frame(&mut self.stdin, &request).await?;

        let deadline = tokio::time::Instant::now() + self.options.timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, read_frame(&mut self.stdout))
                .await
                .map_err(|_| SandboxError::Timeout {
                    plugin: self.plugin_name.clone(),
                    timeout: self.options.timeout,
                })??;

            match frame.get("id").and_then(Value::as_u64) {
                Some(frame_id) if frame_id == id => return Ok(frame),
                // Notifications and stale responses are skipped.
                _ => continue,
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&mut self, method: &str, params: Value) -> Result<(), SandboxError> {
        let notification = json!({"jsonrpc": "2.0", "method": method, "params": params});
        write_frame(&mut self.stdin, &notification).await?;
        Ok(())
    }

    /// Stop the process. Graceful termination sends SIGTERM and waits for
    /// the grace period before SIGKILL; `force` skips straight to SIGKILL.
    pub async fn terminate(&mut self, force: bool) {
        if !self.is_alive() {
            return;
        }

        if !force {
            #[cfg(unix)]
            if let Some(pid) = self.child.id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                if tokio::time::timeout(self.options.grace_period, self.child.wait())
                    .await
                    .is_ok()
                {
                    return;
                }
                warn!(plugin = %self.plugin_name, "graceful shutdown timed out, killing");
            }
        }

        let _ = self.child.start_kill();
        let _ = tokio::time::timeout(Duration::from_secs(1), self.child.wait()).await;
    }
}

//─────────────────────────────
//  Sandbox manager
//─────────────────────────────

/// Launches and tracks plugin processes, enforcing restart rate limits.
pub struct Sandbox {
    options: SandboxOptions,
    bus: Option<Arc<EventBus>>,
    processes: tokio::sync::Mutex<HashMap<String, PluginProcess>>,
    restart_times: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Sandbox {
    /// Manager with the given options, no event bus attached.
    pub fn new(options: SandboxOptions) -> Self {
        Self {
            options,
            bus: None,
            processes: tokio::sync::Mutex::new(HashMap::new()),
            restart_times: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a bus for `plugin.activated` / `plugin.failed` events.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Load the manifest from `plugin_dir`, build its policy, and launch
    /// its entry executable. Returns the plugin name.
    pub async fn launch_from_manifest(
        &self,
        plugin_dir: &Path,
        vault_root: Option<&Path>,
    ) -> Result<String, SandboxError> {
        let manifest = load_manifest(plugin_dir)?;
        let policy = manifest.policy(vault_root);

        for violation in policy.violations() {
            warn!(
                plugin = %manifest.name,
                permission = %violation.permission,
                reason = %violation.reason,
                "manifest policy violation"
            );
        }

        let program = plugin_dir.join(&manifest.entry);
        self.launch(&manifest.name, &program, &[], plugin_dir, policy)
            .await?;
        Ok(manifest.name)
    }

    /// Launch a plugin process with an explicit policy.
    pub async fn launch(
        &self,
        plugin_name: &str,
        program: &Path,
        args: &[String],
        working_dir: &Path,
        policy: Policy,
    ) -> Result<(), SandboxError> {
        if !self.restart_allowed(plugin_name) {
            if let Some(bus) = &self.bus {
                bus.publish(
                    events::PLUGIN_FAILED,
                    json!({
                        "plugin": plugin_name,
                        "reason": "restart limit exceeded",
                        "max_restarts": self.options.max_restarts,
                    }),
                )
                .await;
            }
            return Err(SandboxError::RestartLimitExceeded {
                plugin: plugin_name.to_string(),
                max_restarts: self.options.max_restarts,
                window: self.options.restart_window,
            });
        }

        let env = prepare_environment(&policy, &self.options.env_whitelist);

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(working_dir)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_resource_limits(&mut command, &policy);

        let mut child = command.spawn().map_err(|source| SandboxError::Launch {
            plugin: plugin_name.to_string(),
            source,
        })?;

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout piped"));

        let process = PluginProcess {
            child,
            stdin,
            stdout,
            plugin_name: plugin_name.to_string(),
            policy,
            options: self.options.clone(),
            started_at: Instant::now(),
            next_request_id: 0,
        };

        self.record_restart(plugin_name);
        self.processes
            .lock()
            .await
            .insert(plugin_name.to_string(), process);

        if let Some(bus) = &self.bus {
            bus.publish(events::PLUGIN_ACTIVATED, json!({"plugin": plugin_name}))
                .await;
        }
        info!(plugin = plugin_name, program = %program.display(), "plugin launched");
        Ok(())
    }

    /// Send a request to a running plugin.
    pub async fn request(
        &self,
        plugin_name: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, SandboxError> {
        let mut processes = self.processes.lock().await;
        let process = processes
            .get_mut(plugin_name)
            .ok_or_else(|| SandboxError::NotRunning(plugin_name.to_string()))?;
        process.request(method, params).await
    }

    /// Whether the plugin currently has a live process.
    pub async fn is_running(&self, plugin_name: &str) -> bool {
        let mut processes = self.processes.lock().await;
        processes
            .get_mut(plugin_name)
            .map(PluginProcess::is_alive)
            .unwrap_or(false)
    }

    /// Stop one plugin.
    pub async fn stop(&self, plugin_name: &str, force: bool) {
        let mut processes = self.processes.lock().await;
        if let Some(mut process) = processes.remove(plugin_name) {
            process.terminate(force).await;
            info!(plugin = plugin_name, force, "plugin stopped");
        }
    }

    /// Stop every plugin.
    pub async fn stop_all(&self, force: bool) {
        let mut processes = self.processes.lock().await;
        for (name, mut process) in processes.drain() {
            process.terminate(force).await;
            info!(plugin = %name, force, "plugin stopped");
        }
    }

    /// Names of tracked plugins.
    pub async fn running_plugins(&self) -> Vec<String> {
        let processes = self.processes.lock().await;
        let mut names: Vec<String> = processes.keys().cloned().collect();
        names.sort();
        names
    }

    fn restart_allowed(&self, plugin_name: &str) -> bool {
        let mut times = self.restart_times.lock().expect("restart times poisoned");
        let entry = times.entry(plugin_name.to_string()).or_default();
        let cutoff = Instant::now() - self.options.restart_window;
        entry.retain(|t| *t > cutoff);
        (entry.len() as u32) < self.options.max_restarts
    }

    fn record_restart(&self, plugin_name: &str) {
        self.restart_times
            .lock()
            .expect("restart times poisoned")
            .entry(plugin_name.to_string())
            .or_default()
            .push(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_options() -> SandboxOptions {
        SandboxOptions {
            timeout: Duration::from_secs(2),
            max_restarts: 2,
            restart_window: Duration::from_secs(60),
            grace_period: Duration::from_millis(500),
            ..SandboxOptions::default()
        }
    }

    fn open_policy(name: &str) -> Policy {
        Policy::new(name, vec!["vault.read".into()])
    }

    #[test]
    fn environment_is_whitelisted_and_network_blackholed() {
        let mut base = HashMap::new();
        base.insert("PATH".to_string(), "/usr/bin".to_string());
        base.insert("HOME".to_string(), "/home/u".to_string());
        base.insert("AWS_SECRET_ACCESS_KEY".to_string(), "hunter2".to_string());

        let policy = Policy::new("demo", vec![]);
        let whitelist = vec!["PATH".to_string(), "HOME".to_string()];
        let env = prepare_environment_from(&policy, &whitelist, &base);

        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
        // Network denied: proxy blackhole hints present.
        assert_eq!(env.get("http_proxy").map(String::as_str), Some("http://0.0.0.0:0"));
        assert_eq!(env.get("no_proxy").map(String::as_str), Some("*"));
    }

    #[test]
    fn network_allowed_skips_blackhole() {
        let mut policy = Policy::new("demo", vec!["net".into()]);
        policy.sandbox.network_access = true;
        let env = prepare_environment_from(&policy, &[], &HashMap::new());
        assert!(!env.contains_key("http_proxy"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn request_round_trips_through_a_child_process() {
        // `cat` echoes frames verbatim, exercising framing over real pipes.
        let sandbox = Sandbox::new(fast_options());
        let dir = tempfile::tempdir().unwrap();
        sandbox
            .launch("echo-plugin", Path::new("/bin/cat"), &[], dir.path(), open_policy("echo-plugin"))
            .await
            .unwrap();
        assert!(sandbox.is_running("echo-plugin").await);

        let frame = sandbox
            .request("echo-plugin", "vault.read", json!({"entity_id": "task-1"}))
            .await
            .unwrap();
        assert_eq!(frame["method"], "vault.read");
        assert_eq!(frame["params"]["entity_id"], "task-1");

        sandbox.stop("echo-plugin", true).await;
        assert!(!sandbox.is_running("echo-plugin").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_terminate_kills_within_grace() {
        let sandbox = Sandbox::new(fast_options());
        let dir = tempfile::tempdir().unwrap();
        sandbox
            .launch(
                "sleeper",
                Path::new("/bin/sleep"),
                &["30".to_string()],
                dir.path(),
                open_policy("sleeper"),
            )
            .await
            .unwrap();
        assert!(sandbox.is_running("sleeper").await);

        let started = Instant::now();
        sandbox.stop("sleeper", false).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!sandbox.is_running("sleeper").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restart_limit_disables_plugin_and_emits_failure() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let bus = Arc::new(EventBus::new());
        let failed = Arc::new(AtomicUsize::new(0));
        let failed_clone = failed.clone();
        bus.subscribe(
            events::PLUGIN_FAILED,
            kira_bus_core::handler(move |event| {
                let failed = failed_clone.clone();
                async move {
                    assert_eq!(event.payload["plugin"], "flappy");
                    failed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            None,
            false,
            None,
        );

        let sandbox = Sandbox::new(fast_options()).with_bus(bus);
        let dir = tempfile::tempdir().unwrap();

        for _ in 0..2 {
            sandbox
                .launch("flappy", Path::new("/bin/true"), &[], dir.path(), open_policy("flappy"))
                .await
                .unwrap();
            sandbox.stop("flappy", true).await;
        }

        let err = sandbox
            .launch("flappy", Path::new("/bin/true"), &[], dir.path(), open_policy("flappy"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::RestartLimitExceeded { .. }));
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_program_fails_launch() {
        let sandbox = Sandbox::new(fast_options());
        let dir = tempfile::tempdir().unwrap();
        let err = sandbox
            .launch(
                "ghost",
                Path::new("/nonexistent/program"),
                &[],
                dir.path(),
                open_policy("ghost"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Launch { .. }));
    }

    #[tokio::test]
    async fn request_to_unknown_plugin_fails() {
        let sandbox = Sandbox::new(fast_options());
        let err = sandbox.request("nobody", "ping", json!({})).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotRunning(_)));
    }
}
