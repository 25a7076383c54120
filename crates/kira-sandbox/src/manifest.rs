//! Plugin manifest (`kira-plugin.json`) parsing and validation.
//!
//! The manifest declares what a plugin is, what it may do, and how it is
//! sandboxed. Validation runs against an embedded draft-07 schema before
//! anything is launched; a manifest that does not validate never produces a
//! process.

use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use kira_policy::{Policy, SandboxConfig};

use crate::SandboxError;

/// Manifest filename inside a plugin directory.
pub const MANIFEST_FILE: &str = "kira-plugin.json";

//─────────────────────────────
//  Manifest model
//─────────────────────────────

/// Filesystem access section of the sandbox block.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FsAccess {
    /// Readable path prefixes.
    #[serde(default)]
    pub read: Vec<PathBuf>,
    /// Writable path prefixes.
    #[serde(default)]
    pub write: Vec<PathBuf>,
}

/// Sandbox block of the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestSandbox {
    /// Isolation strategy; only `subprocess` is supported.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Execution timeout in milliseconds.
    #[serde(rename = "timeoutMs", default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Optional address-space cap in megabytes.
    #[serde(rename = "memoryLimit", skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
    /// Whether outbound network access is permitted.
    #[serde(rename = "networkAccess", default)]
    pub network_access: bool,
    /// Filesystem whitelists.
    #[serde(rename = "fsAccess", default)]
    pub fs_access: FsAccess,
}

fn default_strategy() -> String {
    "subprocess".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for ManifestSandbox {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            timeout_ms: default_timeout_ms(),
            memory_limit_mb: None,
            network_access: false,
            fs_access: FsAccess::default(),
        }
    }
}

/// Contribution points declared by a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Contributes {
    /// Events the plugin subscribes to.
    #[serde(default)]
    pub events: Vec<String>,
    /// Commands exposed to users.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Adapters the plugin integrates with.
    #[serde(default)]
    pub adapters: Vec<String>,
}

/// Engine compatibility requirements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Engines {
    /// Required host engine version (SemVer requirement).
    pub kira: String,
}

/// Parsed plugin manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginManifest {
    /// Unique kebab-case identifier.
    pub name: String,
    /// Plugin semantic version.
    pub version: String,
    /// Entry executable, relative to the plugin directory.
    pub entry: String,
    /// Requested permissions.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Sandbox configuration.
    #[serde(default)]
    pub sandbox: ManifestSandbox,
    /// Capabilities implemented by the plugin.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Contribution points.
    #[serde(default)]
    pub contributes: Contributes,
    /// Engine requirements.
    pub engines: Engines,
}

impl PluginManifest {
    /// Build the enforcement [`Policy`] for this manifest.
    pub fn policy(&self, vault_root: Option<&Path>) -> Policy {
        Policy {
            plugin_name: self.name.clone(),
            granted_permissions: self.permissions.clone(),
            sandbox: SandboxConfig {
                strategy: self.sandbox.strategy.clone(),
                timeout_ms: self.sandbox.timeout_ms,
                memory_limit_mb: self.sandbox.memory_limit_mb,
                network_access: self.sandbox.network_access,
                fs_read_paths: self.sandbox.fs_access.read.clone(),
                fs_write_paths: self.sandbox.fs_access.write.clone(),
            },
            vault_root: vault_root.map(Path::to_path_buf),
        }
    }
}

//─────────────────────────────
//  Schema validation
//─────────────────────────────

fn manifest_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["name", "version", "entry", "permissions", "engines"],
        "properties": {
            "name": {
                "type": "string",
                "pattern": "^[a-z0-9][a-z0-9-]*[a-z0-9]$",
                "minLength": 3,
                "maxLength": 50,
            },
            "version": {
                "type": "string",
                "pattern": "^\\d+\\.\\d+\\.\\d+(-[a-zA-Z0-9.-]+)?$",
            },
            "entry": {"type": "string", "minLength": 1},
            "permissions": {
                "type": "array",
                "items": {"type": "string", "enum": kira_policy::KNOWN_PERMISSIONS},
                "uniqueItems": true,
            },
            "capabilities": {
                "type": "array",
                "items": {
                    "type": "string",
                    "enum": [
                        "pull", "push", "timebox", "notify", "schedule",
                        "transform", "validate", "sync", "normalize",
                    ],
                },
                "uniqueItems": true,
            },
            "contributes": {
                "type": "object",
                "properties": {
                    "events": {"type": "array", "items": {"type": "string"}},
                    "commands": {"type": "array", "items": {"type": "string"}},
                    "adapters": {"type": "array", "items": {"type": "string"}},
                },
                "additionalProperties": false,
            },
            "sandbox": {
                "type": "object",
                "properties": {
                    "strategy": {"type": "string", "enum": ["subprocess"]},
                    "timeoutMs": {"type": "integer", "minimum": 1000, "maximum": 300000},
                    "memoryLimit": {"type": "integer", "minimum": 64, "maximum": 1024},
                    "networkAccess": {"type": "boolean"},
                    "fsAccess": {
                        "type": "object",
                        "properties": {
                            "read": {"type": "array", "items": {"type": "string"}},
                            "write": {"type": "array", "items": {"type": "string"}},
                        },
                        "additionalProperties": false,
                    },
                },
                "additionalProperties": false,
            },
            "engines": {
                "type": "object",
                "required": ["kira"],
                "properties": {
                    "kira": {"type": "string", "pattern": "^\\^?\\d+\\.\\d+\\.\\d+$"},
                },
                "additionalProperties": false,
            },
        },
    })
}

/// Validate a raw manifest value and parse it.
pub fn parse_manifest(value: &Value) -> Result<PluginManifest, SandboxError> {
    let schema = manifest_schema();
    let compiled = JSONSchema::compile(&schema).expect("embedded manifest schema compiles");

    if let Err(errors) = compiled.validate(value) {
        let messages: Vec<String> = errors
            .map(|e| format!("{} (at {})", e, e.instance_path))
            .collect();
        return Err(SandboxError::InvalidManifest(messages.join("; ")));
    }

    serde_json::from_value(value.clone())
        .map_err(|e| SandboxError::InvalidManifest(e.to_string()))
}

/// Load and validate `kira-plugin.json` from a plugin directory.
pub fn load_manifest(plugin_dir: &Path) -> Result<PluginManifest, SandboxError> {
    let path = plugin_dir.join(MANIFEST_FILE);
    let raw = std::fs::read_to_string(&path).map_err(|e| SandboxError::ManifestIo {
        path: path.clone(),
        source: e,
    })?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| SandboxError::InvalidManifest(format!("{}: {e}", path.display())))?;
    parse_manifest(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_manifest() -> Value {
        json!({
            "name": "gcal-sync",
            "version": "1.2.0",
            "entry": "bin/gcal-sync",
            "permissions": ["vault.read", "vault.write", "net"],
            "capabilities": ["pull", "push", "sync"],
            "contributes": {"events": ["sync.tick"], "commands": ["gcal.pull"]},
            "sandbox": {
                "strategy": "subprocess",
                "timeoutMs": 30000,
                "memoryLimit": 256,
                "networkAccess": true,
                "fsAccess": {"read": ["/tmp/gcal"], "write": ["/tmp/gcal"]},
            },
            "engines": {"kira": "^0.2.0"},
        })
    }

    #[test]
    fn valid_manifest_parses() {
        let manifest = parse_manifest(&valid_manifest()).unwrap();
        assert_eq!(manifest.name, "gcal-sync");
        assert_eq!(manifest.sandbox.timeout_ms, 30000);
        assert_eq!(manifest.sandbox.memory_limit_mb, Some(256));
        assert!(manifest.sandbox.network_access);
        assert_eq!(manifest.contributes.events, ["sync.tick"]);
    }

    #[test]
    fn missing_required_fields_fail() {
        let mut value = valid_manifest();
        value.as_object_mut().unwrap().remove("engines");
        assert!(matches!(parse_manifest(&value), Err(SandboxError::InvalidManifest(_))));
    }

    #[test]
    fn unknown_permission_fails_schema() {
        let mut value = valid_manifest();
        value["permissions"] = json!(["vault.read", "root.everything"]);
        let err = parse_manifest(&value).unwrap_err();
        assert!(err.to_string().contains("permissions") || err.to_string().contains("enum"));
    }

    #[test]
    fn bad_name_pattern_fails() {
        let mut value = valid_manifest();
        value["name"] = json!("Bad Name!");
        assert!(parse_manifest(&value).is_err());
    }

    #[test]
    fn sandbox_defaults_apply_when_omitted() {
        let value = json!({
            "name": "minimal",
            "version": "0.1.0",
            "entry": "bin/minimal",
            "permissions": [],
            "engines": {"kira": "^0.2.0"},
        });
        let manifest = parse_manifest(&value).unwrap();
        assert_eq!(manifest.sandbox.strategy, "subprocess");
        assert_eq!(manifest.sandbox.timeout_ms, 30_000);
        assert!(!manifest.sandbox.network_access);
    }

    #[test]
    fn manifest_builds_policy_with_vault_root() {
        let manifest = parse_manifest(&valid_manifest()).unwrap();
        let policy = manifest.policy(Some(Path::new("/home/u/vault")));
        assert_eq!(policy.plugin_name, "gcal-sync");
        assert!(policy.check_network_access().is_ok());
        assert!(policy
            .check_fs_read_access(Path::new("/home/u/vault/tasks/x.md"))
            .is_err());
    }

    #[test]
    fn load_manifest_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            serde_json::to_string_pretty(&valid_manifest()).unwrap(),
        )
        .unwrap();
        let manifest = load_manifest(dir.path()).unwrap();
        assert_eq!(manifest.version, "1.2.0");

        let missing = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_manifest(missing.path()),
            Err(SandboxError::ManifestIo { .. })
        ));
    }
}
