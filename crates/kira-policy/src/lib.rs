#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-policy** – Permission checks for sandboxed plugins.
//!
//! A plugin declares permissions in its manifest and the host enforces them
//! on every RPC. The checks here are stateless: a [`Policy`] value carries
//! the granted set plus the manifest's sandbox section, and the sandbox
//! calls into it before touching anything on the plugin's behalf.
//!
//! Two rules have no exceptions: network access requires BOTH the `net`
//! permission and `sandbox.network_access`, and paths under the vault root
//! are always denied — the vault is reachable only through the Host API
//! RPC surface.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Permission vocabulary
//─────────────────────────────

/// The closed permission set plugins may request.
pub const KNOWN_PERMISSIONS: [&str; 14] = [
    "calendar.read",
    "calendar.write",
    "vault.read",
    "vault.write",
    "fs.read",
    "fs.write",
    "net",
    "secrets.read",
    "secrets.write",
    "events.publish",
    "events.subscribe",
    "scheduler.create",
    "scheduler.cancel",
    "sandbox.execute",
];

/// Whether `permission` is in the closed vocabulary.
pub fn is_known_permission(permission: &str) -> bool {
    KNOWN_PERMISSIONS.contains(&permission)
}

//─────────────────────────────
//  Errors & violations
//─────────────────────────────

/// Raised when a plugin attempts an operation without the required grant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("permission denied: {permission} ({reason})")]
pub struct PermissionDenied {
    /// Permission that was required.
    pub permission: String,
    /// Why the check failed.
    pub reason: String,
}

impl PermissionDenied {
    fn new(permission: &str, reason: impl Into<String>) -> Self {
        Self { permission: permission.to_string(), reason: reason.into() }
    }
}

/// A diagnostic inconsistency in a manifest (not a runtime denial).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    /// Permission or area the finding concerns.
    pub permission: String,
    /// Human-readable description.
    pub reason: String,
}

//─────────────────────────────
//  Sandbox section
//─────────────────────────────

/// Sandbox configuration as declared in a plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Isolation strategy; only `subprocess` is implemented.
    pub strategy: String,
    /// Execution timeout in milliseconds.
    pub timeout_ms: u64,
    /// Optional address-space cap in megabytes.
    pub memory_limit_mb: Option<u64>,
    /// Whether the sandbox permits outbound network access.
    pub network_access: bool,
    /// Whitelisted read path prefixes.
    pub fs_read_paths: Vec<PathBuf>,
    /// Whitelisted write path prefixes.
    pub fs_write_paths: Vec<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            strategy: "subprocess".to_string(),
            timeout_ms: 30_000,
            memory_limit_mb: None,
            network_access: false,
            fs_read_paths: Vec::new(),
            fs_write_paths: Vec::new(),
        }
    }
}

//─────────────────────────────
//  Policy
//─────────────────────────────

/// Granted permissions plus sandbox settings for one plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    /// Plugin the policy belongs to.
    pub plugin_name: String,
    /// Permissions granted by the manifest.
    pub granted_permissions: Vec<String>,
    /// Sandbox section of the manifest.
    pub sandbox: SandboxConfig,
    /// Vault root; always denied for direct filesystem access.
    pub vault_root: Option<PathBuf>,
}

impl Policy {
    /// Policy with the given grants and default sandbox settings.
    pub fn new(plugin_name: impl Into<String>, granted: Vec<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            granted_permissions: granted,
            sandbox: SandboxConfig::default(),
            vault_root: None,
        }
    }

    /// Whether `permission` is granted.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.granted_permissions.iter().any(|p| p == permission)
    }

    /// Require `permission`, failing with context when absent.
    pub fn check_permission(&self, permission: &str) -> Result<(), PermissionDenied> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(PermissionDenied::new(
                permission,
                format!("plugin '{}' lacks permission '{permission}'", self.plugin_name),
            ))
        }
    }

    /// Network access needs the `net` grant AND the sandbox flag.
    pub fn check_network_access(&self) -> Result<(), PermissionDenied> {
        if !self.has_permission("net") {
            return Err(PermissionDenied::new("net", "network access not granted in manifest"));
        }
        if !self.sandbox.network_access {
            return Err(PermissionDenied::new(
                "net",
                "network access disabled in sandbox configuration",
            ));
        }
        Ok(())
    }

    /// Filesystem read: `fs.read` grant, not under the vault root, and
    /// within the read whitelist.
    pub fn check_fs_read_access(&self, path: &Path) -> Result<(), PermissionDenied> {
        self.check_fs_access(path, "fs.read", &self.sandbox.fs_read_paths)
    }

    /// Filesystem write: `fs.write` grant, not under the vault root, and
    /// within the write whitelist.
    pub fn check_fs_write_access(&self, path: &Path) -> Result<(), PermissionDenied> {
        self.check_fs_access(path, "fs.write", &self.sandbox.fs_write_paths)
    }

    fn check_fs_access(
        &self,
        path: &Path,
        permission: &str,
        allowlist: &[PathBuf],
    ) -> Result<(), PermissionDenied> {
        self.check_permission(permission)?;

        let normalized = normalize_path(path);

        if let Some(vault_root) = &self.vault_root {
            if normalized.starts_with(normalize_path(vault_root)) {
                return Err(PermissionDenied::new(
                    permission,
                    format!(
                        "direct vault access forbidden (path: {}); use the Host API",
                        path.display()
                    ),
                ));
            }
        }

        let allowed = allowlist
            .iter()
            .any(|prefix| normalized.starts_with(normalize_path(prefix)));
        if !allowed {
            return Err(PermissionDenied::new(
                permission,
                format!("path {} not in allowlist", path.display()),
            ));
        }
        Ok(())
    }

    /// Diagnostic warnings for semantically inconsistent manifests.
    pub fn violations(&self) -> Vec<PolicyViolation> {
        let mut findings = Vec::new();

        for permission in &self.granted_permissions {
            if !is_known_permission(permission) {
                findings.push(PolicyViolation {
                    permission: permission.clone(),
                    reason: format!("unknown permission '{permission}'"),
                });
            }
        }

        if self.has_permission("net") && !self.sandbox.network_access {
            findings.push(PolicyViolation {
                permission: "net".into(),
                reason: "permission granted but sandbox.network_access is false".into(),
            });
        }
        if !self.has_permission("net") && self.sandbox.network_access {
            findings.push(PolicyViolation {
                permission: "net".into(),
                reason: "sandbox.network_access is true without the net permission".into(),
            });
        }

        if self.has_permission("fs.read") && self.sandbox.fs_read_paths.is_empty() {
            findings.push(PolicyViolation {
                permission: "fs.read".into(),
                reason: "fs.read granted but no read paths whitelisted".into(),
            });
        }
        if self.has_permission("fs.write") && self.sandbox.fs_write_paths.is_empty() {
            findings.push(PolicyViolation {
                permission: "fs.write".into(),
                reason: "fs.write granted but no write paths whitelisted".into(),
            });
        }

        if let Some(vault_root) = &self.vault_root {
            let vault_root = normalize_path(vault_root);
            for (label, paths) in [
                ("fs_read_paths", &self.sandbox.fs_read_paths),
                ("fs_write_paths", &self.sandbox.fs_write_paths),
            ] {
                for path in paths {
                    if normalize_path(path).starts_with(&vault_root) {
                        findings.push(PolicyViolation {
                            permission: label.into(),
                            reason: format!(
                                "{label} entry {} overlaps the vault root",
                                path.display()
                            ),
                        });
                    }
                }
            }
        }

        findings
    }
}

/// Lexical path normalization: resolves `.` and `..` without touching the
/// filesystem, so traversal tricks cannot escape an allowlisted prefix.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with_fs() -> Policy {
        Policy {
            plugin_name: "demo".into(),
            granted_permissions: vec!["fs.read".into(), "fs.write".into(), "vault.read".into()],
            sandbox: SandboxConfig {
                fs_read_paths: vec![PathBuf::from("/tmp/plugin-data")],
                fs_write_paths: vec![PathBuf::from("/tmp/plugin-out")],
                ..SandboxConfig::default()
            },
            vault_root: Some(PathBuf::from("/home/user/vault")),
        }
    }

    #[test]
    fn missing_permission_is_denied_with_context() {
        let policy = Policy::new("demo", vec!["vault.read".into()]);
        let err = policy.check_permission("vault.write").unwrap_err();
        assert_eq!(err.permission, "vault.write");
        assert!(err.reason.contains("demo"));
        assert!(policy.check_permission("vault.read").is_ok());
    }

    #[test]
    fn network_needs_both_grant_and_sandbox_flag() {
        let mut policy = Policy::new("demo", vec![]);
        assert!(policy.check_network_access().is_err());

        policy.granted_permissions.push("net".into());
        assert!(policy.check_network_access().is_err(), "sandbox flag still false");

        policy.sandbox.network_access = true;
        assert!(policy.check_network_access().is_ok());
    }

    #[test]
    fn fs_access_respects_allowlists() {
        let policy = policy_with_fs();
        assert!(policy.check_fs_read_access(Path::new("/tmp/plugin-data/cache.json")).is_ok());
        assert!(policy.check_fs_read_access(Path::new("/etc/passwd")).is_err());
        assert!(policy.check_fs_write_access(Path::new("/tmp/plugin-out/result.txt")).is_ok());
        // Read allowlist does not grant writes.
        assert!(policy.check_fs_write_access(Path::new("/tmp/plugin-data/cache.json")).is_err());
    }

    #[test]
    fn vault_paths_are_always_denied() {
        let mut policy = policy_with_fs();
        // Even a whitelisted prefix cannot expose the vault.
        policy.sandbox.fs_read_paths.push(PathBuf::from("/home/user"));

        let err = policy
            .check_fs_read_access(Path::new("/home/user/vault/tasks/task-1.md"))
            .unwrap_err();
        assert!(err.reason.contains("Host API"));
    }

    #[test]
    fn traversal_cannot_escape_the_allowlist() {
        let policy = policy_with_fs();
        let sneaky = Path::new("/tmp/plugin-data/../../etc/shadow");
        assert!(policy.check_fs_read_access(sneaky).is_err());
    }

    #[test]
    fn normalize_path_is_lexical() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_path(Path::new("/a/../../b")), PathBuf::from("/b"));
    }

    #[test]
    fn violations_flag_inconsistent_manifests() {
        let mut policy = Policy::new("demo", vec!["net".into(), "fs.read".into(), "made.up".into()]);
        policy.vault_root = Some(PathBuf::from("/v"));
        policy.sandbox.fs_write_paths.push(PathBuf::from("/v/artifacts"));

        let violations = policy.violations();
        let reasons: Vec<&str> = violations.iter().map(|v| v.reason.as_str()).collect();

        assert!(reasons.iter().any(|r| r.contains("unknown permission")));
        assert!(reasons.iter().any(|r| r.contains("network_access is false")));
        assert!(reasons.iter().any(|r| r.contains("no read paths")));
        assert!(reasons.iter().any(|r| r.contains("overlaps the vault root")));
    }

    #[test]
    fn clean_manifest_has_no_violations() {
        let policy = Policy::new("demo", vec!["vault.read".into(), "events.publish".into()]);
        assert!(policy.violations().is_empty());
    }
}
