//! Deterministic YAML serialization for front-matter.
//!
//! Serialization guarantees a canonical form: fixed key ordering, ISO-8601
//! UTC timestamps, and stable quoting. Parsing any canonical document and
//! re-serializing it is a fixed point, and two metadata mappings with equal
//! keys and values serialize to byte-identical output regardless of
//! insertion order.

use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashSet;

use kira_types::Metadata;

use crate::MdError;

/// Canonical key ordering. Keys appear in this order; unlisted keys follow
/// alphabetically.
pub const CANONICAL_KEY_ORDER: [&str; 29] = [
    // Core identity
    "id",
    "title",
    // Entity metadata
    "type",
    "status",
    "state",
    "priority",
    // Timestamps (always UTC ISO-8601)
    "created",
    "updated",
    "due_date",
    "start_time",
    "end_time",
    "done_ts",
    "start_ts",
    // Classification
    "tags",
    "category",
    // Relationships
    "relates_to",
    "depends_on",
    "blocks",
    "parent",
    "links",
    // Optional fields
    "description",
    "assignee",
    "estimate",
    "location",
    "attendees",
    "calendar",
    "source",
    "reopen_reason",
    // Sync metadata
    "x-kira",
];

static TIMESTAMP_FIELDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "created",
        "updated",
        "due_date",
        "start_time",
        "end_time",
        "done_ts",
        "start_ts",
        "created_ts",
        "updated_ts",
        "due_ts",
        "last_write_ts",
    ]
    .into_iter()
    .collect()
});

/// Order `keys` canonically: listed keys first in list order, the rest
/// alphabetically.
pub fn canonical_key_order<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut known: Vec<&str> = Vec::new();
    let mut unknown: Vec<&str> = Vec::new();
    for key in keys {
        if CANONICAL_KEY_ORDER.contains(&key) {
            known.push(key);
        } else {
            unknown.push(key);
        }
    }
    known.sort_by_key(|k| CANONICAL_KEY_ORDER.iter().position(|c| c == k));
    unknown.sort_unstable();
    known.extend(unknown);
    known
}

/// Normalise every timestamp-valued field to ISO-8601 UTC, recursing into
/// nested mappings (the `x-kira` block carries `last_write_ts`).
pub fn normalize_timestamps_to_utc(data: &Metadata) -> Metadata {
    let mut result = Metadata::new();
    for (key, value) in data {
        let normalized = match value {
            Value::String(s) if TIMESTAMP_FIELDS.contains(key.as_str()) => {
                match kira_time::parse_utc_iso8601(s) {
                    Ok(dt) => Value::String(kira_time::format_utc_iso8601(dt)),
                    Err(_) => value.clone(),
                }
            }
            Value::Object(nested) => Value::Object(normalize_timestamps_to_utc(nested)),
            other => other.clone(),
        };
        result.insert(key.clone(), normalized);
    }
    result
}

//─────────────────────────────
//  Emission
//─────────────────────────────

fn needs_quoting(s: &str) -> bool {
    if s.is_empty() {
        return true;
    }
    if s.starts_with([' ', '-', '[', ']', '{', '}', ',', '?', '`', '\'', '"'])
        || s.ends_with(' ')
    {
        return true;
    }
    if s.contains(['\n', '#', '|', '>', '&', '*', '!', '%', '@']) {
        return true;
    }
    // A colon only breaks a plain scalar when followed by a space (or at
    // the end of the value).
    if s.contains(": ") || s.ends_with(':') {
        return true;
    }
    // Plain scalars that YAML would re-type must stay strings.
    matches!(s, "null" | "~" | "true" | "false" | "yes" | "no" | "on" | "off")
        || s.parse::<f64>().is_ok()
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn emit_scalar(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            if needs_quoting(s) {
                quote(s)
            } else {
                s.clone()
            }
        }
        // Flow form for the rare scalar position holding a collection.
        other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
    }
}

fn emit_value(lines: &mut Vec<String>, key: &str, value: &Value, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        Value::Object(map) => {
            lines.push(format!("{pad}{key}:"));
            for nested_key in canonical_key_order(map.keys().map(String::as_str)) {
                emit_value(lines, nested_key, &map[nested_key], indent + 1);
            }
        }
        Value::Array(items) => {
            if items.is_empty() {
                lines.push(format!("{pad}{key}: []"));
            } else {
                lines.push(format!("{pad}{key}:"));
                for item in items {
                    lines.push(format!("{pad}  - {}", emit_scalar(item)));
                }
            }
        }
        scalar => lines.push(format!("{pad}{key}: {}", emit_scalar(scalar))),
    }
}

/// Serialize front-matter to deterministic YAML (no document markers).
pub fn serialize_frontmatter(data: &Metadata) -> String {
    let normalized = normalize_timestamps_to_utc(data);
    let mut lines = Vec::new();
    for key in canonical_key_order(normalized.keys().map(String::as_str)) {
        emit_value(&mut lines, key, &normalized[key], 0);
    }
    lines.join("\n")
}

//─────────────────────────────
//  Parsing
//─────────────────────────────

fn yaml_to_json(value: serde_yaml::Value) -> Result<Value, MdError> {
    match value {
        serde_yaml::Value::Null => Ok(Value::Null),
        serde_yaml::Value::Bool(b) => Ok(Value::Bool(b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::from(i))
            } else if let Some(u) = n.as_u64() {
                Ok(Value::from(u))
            } else {
                Ok(n.as_f64().map(Value::from).unwrap_or(Value::Null))
            }
        }
        serde_yaml::Value::String(s) => Ok(Value::String(s)),
        serde_yaml::Value::Sequence(items) => {
            let converted: Result<Vec<_>, _> = items.into_iter().map(yaml_to_json).collect();
            Ok(Value::Array(converted?))
        }
        serde_yaml::Value::Mapping(map) => {
            let mut object = serde_json::Map::new();
            for (k, v) in map {
                let key = match k {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(MdError::InvalidFrontmatter(format!(
                            "non-scalar mapping key: {other:?}"
                        )))
                    }
                };
                object.insert(key, yaml_to_json(v)?);
            }
            Ok(Value::Object(object))
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

/// Parse a YAML front-matter block into a metadata mapping.
pub fn parse_frontmatter(yaml_str: &str) -> Result<Metadata, MdError> {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml_str)
        .map_err(|e| MdError::InvalidFrontmatter(e.to_string()))?;

    match value {
        serde_yaml::Value::Null => Ok(Metadata::new()),
        serde_yaml::Value::Mapping(_) => match yaml_to_json(value)? {
            Value::Object(map) => Ok(map),
            _ => unreachable!("mapping converts to object"),
        },
        other => Err(MdError::InvalidFrontmatter(format!(
            "frontmatter must be a mapping, got: {other:?}"
        ))),
    }
}
