#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-schemas** – Entity validation: JSON schema plus business rules.
//!
//! Validation runs before every vault write; an entity that fails never
//! touches disk. Three layers, all collected into one
//! [`ValidationOutcome`]:
//!
//! 1. strict required-key checks (`id`, `title`, `created`, `updated`, with
//!    the historical `uid`/`*_ts` aliases),
//! 2. the per-kind JSON schema (embedded draft-07 defaults, overridable by
//!    files under `.kira/schemas/<kind>.json`),
//! 3. business rules (see [`rules`]).
//!
//! The schema files also carry the folder contract: the front-matter fields
//! an entity must have to live in its kind's folder.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use serde_json::{json, Value};
use tracing::warn;

use kira_types::{EntityKind, Metadata};

pub mod rules;

//─────────────────────────────
//  Errors & outcome
//─────────────────────────────

/// Errors raised while loading or compiling schemas.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Schema file exists but is not valid JSON.
    #[error("invalid schema file {path}: {reason}")]
    InvalidSchemaFile {
        /// Offending file.
        path: PathBuf,
        /// Parse or compile failure.
        reason: String,
    },
    /// Filesystem failure while reading a schema file.
    #[error("failed to read schema {path}: {source}")]
    Io {
        /// Offending file.
        path: PathBuf,
        /// OS-level error.
        #[source]
        source: std::io::Error,
    },
}

/// Result of validating an entity. Never mutates the input.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    /// All collected errors; empty means valid.
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    /// Whether the entity passed every layer.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn extend_prefixed(&mut self, prefix: &str, errors: Vec<String>) {
        self.errors
            .extend(errors.into_iter().map(|e| format!("{prefix}: {e}")));
    }
}

//─────────────────────────────
//  Strict required keys
//─────────────────────────────

/// Required-key check shared by every kind. Aliases mirror the historical
/// on-disk shapes (`uid` for `id`, `created_ts` for `created`).
pub fn validate_strict(kind: EntityKind, data: &Metadata) -> Vec<String> {
    let mut errors = Vec::new();

    let required: [(&str, &[&str]); 4] = [
        ("id", &["id", "uid"]),
        ("title", &["title"]),
        ("created", &["created", "created_ts"]),
        ("updated", &["updated", "updated_ts"]),
    ];
    for (field, aliases) in required {
        if !aliases.iter().any(|key| data.contains_key(*key)) {
            errors.push(format!(
                "missing required field: {field} (tried: {})",
                aliases.join(", ")
            ));
        }
    }

    if matches!(kind, EntityKind::Task | EntityKind::Project)
        && !["state", "status"].iter().any(|key| data.contains_key(*key))
    {
        errors.push("missing required field: status (tried: state, status)".to_string());
    }

    if let Some(tags) = data.get("tags") {
        if !tags.is_null() && !tags.is_array() {
            errors.push("field 'tags' must be a list".to_string());
        }
    }

    for field in ["created", "updated", "due_date", "start_time", "end_time"] {
        if let Some(Value::String(value)) = data.get(field) {
            if !value.is_empty() && kira_time::parse_utc_iso8601(value).is_err() {
                errors.push(format!("field '{field}' is not valid ISO-8601: {value}"));
            }
        }
    }

    errors
}

//─────────────────────────────
//  Embedded default schemas
//─────────────────────────────

fn default_schema(kind: EntityKind) -> Value {
    let mut schema = json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": {
            "id": {"type": "string"},
            "title": {"type": "string"},
            "tags": {"type": "array", "items": {"type": "string"}},
            "created": {"type": "string"},
            "updated": {"type": "string"},
        },
        "folder_contracts": {
            "folder": kind.folder(),
            "required_frontmatter": ["id", "title"],
        },
    });

    match kind {
        EntityKind::Task => {
            schema["properties"]["status"] = json!({
                "type": "string",
                "enum": rules::TASK_STATUSES,
            });
            schema["folder_contracts"]["required_frontmatter"] = json!(["id", "title", "status"]);
        }
        EntityKind::Event => {
            schema["properties"]["start_time"] = json!({"type": "string"});
            schema["properties"]["end_time"] = json!({"type": "string"});
            schema["folder_contracts"]["required_frontmatter"] =
                json!(["id", "title", "start_time"]);
        }
        EntityKind::Project => {
            schema["properties"]["status"] = json!({"type": "string"});
        }
        EntityKind::Note | EntityKind::Contact | EntityKind::Meeting => {}
    }

    schema
}

/// Write the embedded default schema files for kinds that have no override
/// yet (vault bootstrap). Returns how many files were written.
pub fn write_default_schemas(schema_dir: impl AsRef<Path>) -> Result<usize, SchemaError> {
    let schema_dir = schema_dir.as_ref();
    fs::create_dir_all(schema_dir).map_err(|source| SchemaError::Io {
        path: schema_dir.to_path_buf(),
        source,
    })?;

    let mut written = 0usize;
    for kind in EntityKind::ALL {
        let path = schema_dir.join(format!("{kind}.json"));
        if path.exists() {
            continue;
        }
        let rendered = serde_json::to_string_pretty(&default_schema(kind))
            .expect("embedded schema serializes");
        fs::write(&path, rendered).map_err(|source| SchemaError::Io { path: path.clone(), source })?;
        written += 1;
    }
    Ok(written)
}

//─────────────────────────────
//  Schema cache
//─────────────────────────────

struct CachedSchema {
    compiled: JSONSchema,
    required_frontmatter: Vec<String>,
}

/// Compiled per-kind schemas with folder contracts.
///
/// Defaults are embedded; a file at `<schema_dir>/<kind>.json` overrides the
/// default for that kind. Unreadable override files are reported once and
/// skipped.
pub struct SchemaCache {
    schemas: HashMap<EntityKind, CachedSchema>,
}

impl SchemaCache {
    /// Build the cache, merging file overrides from `schema_dir` over the
    /// embedded defaults.
    pub fn new(schema_dir: impl AsRef<Path>) -> Self {
        let schema_dir = schema_dir.as_ref();
        let mut schemas = HashMap::new();

        for kind in EntityKind::ALL {
            let value = match Self::load_override(schema_dir, kind) {
                Ok(Some(value)) => value,
                Ok(None) => default_schema(kind),
                Err(err) => {
                    warn!(kind = %kind, error = %err, "falling back to embedded schema");
                    default_schema(kind)
                }
            };

            let required_frontmatter = value
                .get("folder_contracts")
                .and_then(|c| c.get("required_frontmatter"))
                .and_then(Value::as_array)
                .map(|fields| {
                    fields
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            match JSONSchema::compile(&value) {
                Ok(compiled) => {
                    schemas.insert(kind, CachedSchema { compiled, required_frontmatter });
                }
                Err(err) => {
                    warn!(kind = %kind, error = %err, "schema failed to compile; using default");
                    let fallback = default_schema(kind);
                    let compiled = JSONSchema::compile(&fallback)
                        .expect("embedded default schema compiles");
                    schemas.insert(kind, CachedSchema { compiled, required_frontmatter });
                }
            }
        }

        Self { schemas }
    }

    fn load_override(
        schema_dir: &Path,
        kind: EntityKind,
    ) -> Result<Option<Value>, SchemaError> {
        let path = schema_dir.join(format!("{kind}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .map_err(|source| SchemaError::Io { path: path.clone(), source })?;
        let value = serde_json::from_str(&raw).map_err(|e| SchemaError::InvalidSchemaFile {
            path,
            reason: e.to_string(),
        })?;
        Ok(Some(value))
    }

    /// Schema-layer errors for `data` against the kind's compiled schema.
    pub fn schema_errors(&self, kind: EntityKind, data: &Metadata) -> Vec<String> {
        let Some(cached) = self.schemas.get(&kind) else {
            return Vec::new();
        };
        let value = Value::Object(data.clone());
        let result = match cached.compiled.validate(&value) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| format!("{} (at {})", e, e.instance_path))
                .collect(),
        };
        result
    }

    /// Front-matter fields the folder contract requires for `kind`.
    pub fn required_frontmatter(&self, kind: EntityKind) -> &[String] {
        self.schemas
            .get(&kind)
            .map(|c| c.required_frontmatter.as_slice())
            .unwrap_or_default()
    }

    /// Folder-contract violations: required fields that are absent or empty.
    pub fn folder_contract_violations(&self, kind: EntityKind, data: &Metadata) -> Vec<String> {
        self.required_frontmatter(kind)
            .iter()
            .filter(|field| match data.get(field.as_str()) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            })
            .map(|field| format!("missing required frontmatter field: {field}"))
            .collect()
    }
}

//─────────────────────────────
//  Entry point
//─────────────────────────────

/// Validate an entity against every layer. The outcome collects all errors
/// rather than stopping at the first.
pub fn validate_entity(
    cache: &SchemaCache,
    kind: EntityKind,
    data: &Metadata,
) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();

    outcome.extend_prefixed("schema", validate_strict(kind, data));
    outcome.extend_prefixed("schema", cache.schema_errors(kind, data));

    match kind {
        EntityKind::Task => outcome.extend_prefixed("task", rules::validate_task(data)),
        EntityKind::Note => outcome.extend_prefixed("note", rules::validate_note(data)),
        EntityKind::Event => outcome.extend_prefixed("event", rules::validate_event(data)),
        _ => {}
    }

    outcome.extend_prefixed("common", rules::validate_common(data));
    outcome
}
