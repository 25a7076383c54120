//! Business rules applied after schema validation.
//!
//! These encode the domain constraints that JSON schema cannot express
//! cleanly: cross-field requirements, timestamp ordering, and link-ID
//! well-formedness. Rules never mutate their input.

use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use kira_types::{Metadata, MAX_TITLE_LEN};

/// Statuses a task may carry.
pub const TASK_STATUSES: [&str; 5] = ["todo", "doing", "review", "done", "blocked"];

/// Priorities an entity may carry.
pub const PRIORITIES: [&str; 4] = ["low", "medium", "high", "urgent"];

static ESTIMATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(\.\d+)?[hmd]$").unwrap());

/// Earliest acceptable due date relative to now.
const DUE_DATE_PAST_DAYS: i64 = 365;
/// Latest acceptable due date relative to now.
const DUE_DATE_FUTURE_DAYS: i64 = 3650;

fn str_field<'a>(data: &'a Metadata, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn status_of(data: &Metadata) -> Option<&str> {
    str_field(data, "status").or_else(|| str_field(data, "state"))
}

/// Task-specific rules: status machine, blocked/done field requirements,
/// estimate grammar, due-date sanity.
pub fn validate_task(data: &Metadata) -> Vec<String> {
    let mut errors = Vec::new();

    let status = status_of(data);
    if let Some(status) = status {
        if !TASK_STATUSES.contains(&status) {
            errors.push(format!(
                "invalid status: {status}; must be one of: {}",
                TASK_STATUSES.join(", ")
            ));
        }
    }

    if let Some(priority) = str_field(data, "priority") {
        if !PRIORITIES.contains(&priority) {
            errors.push(format!(
                "invalid priority: {priority}; must be one of: {}",
                PRIORITIES.join(", ")
            ));
        }
    }

    if status == Some("blocked") && str_field(data, "blocked_reason").map_or(true, str::is_empty) {
        errors.push("blocked tasks must have 'blocked_reason'".to_string());
    }

    if status == Some("done") && str_field(data, "done_ts").map_or(true, str::is_empty) {
        errors.push("done tasks must have 'done_ts' timestamp".to_string());
    }

    if let Some(estimate) = str_field(data, "estimate") {
        if !ESTIMATE.is_match(&estimate.to_lowercase()) {
            errors.push(format!(
                "invalid estimate format: {estimate}; use a format like '2h', '30m', '1d'"
            ));
        }
    }

    if let Some(due) = str_field(data, "due_date").or_else(|| str_field(data, "due_ts")) {
        match kira_time::parse_utc_iso8601(due) {
            Ok(due_dt) => {
                let now = kira_time::now_utc();
                if due_dt < now - Duration::days(DUE_DATE_PAST_DAYS) {
                    errors.push(format!("due_date too far in the past: {due}"));
                }
                if due_dt > now + Duration::days(DUE_DATE_FUTURE_DAYS) {
                    errors.push(format!("due_date too far in the future: {due}"));
                }
            }
            Err(_) => errors.push(format!("invalid due_date: {due}")),
        }
    }

    errors
}

/// Note-specific rules: a note must be classifiable by category or tags.
/// A present-but-empty `tags` list satisfies the rule.
pub fn validate_note(data: &Metadata) -> Vec<String> {
    let has_category = str_field(data, "category").is_some_and(|c| !c.is_empty());
    let has_tags_key = data.contains_key("tags");

    if !has_category && !has_tags_key {
        vec!["notes must have either 'category' or 'tags' for organization".to_string()]
    } else {
        Vec::new()
    }
}

/// Event-specific rules: required start time, ordered end time.
pub fn validate_event(data: &Metadata) -> Vec<String> {
    let mut errors = Vec::new();

    let start = str_field(data, "start_time");
    if start.map_or(true, str::is_empty) {
        errors.push("events must have 'start_time'".to_string());
    }

    if let (Some(start), Some(end)) = (start, str_field(data, "end_time")) {
        match (
            kira_time::parse_utc_iso8601(start),
            kira_time::parse_utc_iso8601(end),
        ) {
            (Ok(start_dt), Ok(end_dt)) => {
                if end_dt <= start_dt {
                    errors.push(format!("end_time ({end}) must be after start_time ({start})"));
                }
            }
            _ => errors.push("invalid start_time/end_time datetime format".to_string()),
        }
    }

    errors
}

/// Rules common to every kind: title bounds and link-array well-formedness.
pub fn validate_common(data: &Metadata) -> Vec<String> {
    let mut errors = Vec::new();

    if let Some(title) = data.get("title") {
        let title = title.as_str().unwrap_or_default();
        if title.trim().is_empty() {
            errors.push("title cannot be empty".to_string());
        }
        if title.chars().count() > MAX_TITLE_LEN {
            errors.push(format!(
                "title too long: {} characters (max {MAX_TITLE_LEN})",
                title.chars().count()
            ));
        }
    }

    for link_field in ["relates_to", "depends_on", "blocks", "links"] {
        let Some(links) = data.get(link_field) else { continue };
        match links {
            Value::Array(items) => {
                for item in items {
                    match item.as_str() {
                        Some(link) if kira_ids::is_valid_entity_id(link) => {}
                        Some(link) => errors.push(format!(
                            "invalid entity ID format in '{link_field}': {link}"
                        )),
                        None => errors.push(format!(
                            "link in '{link_field}' must be a string"
                        )),
                    }
                }
            }
            _ => errors.push(format!("field '{link_field}' must be a list")),
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: &[(&str, Value)]) -> Metadata {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn blocked_requires_reason() {
        let errors = validate_task(&meta(&[("status", json!("blocked"))]));
        assert!(errors.iter().any(|e| e.contains("blocked_reason")));

        let errors = validate_task(&meta(&[
            ("status", json!("blocked")),
            ("blocked_reason", json!("waiting on review")),
        ]));
        assert!(errors.is_empty());
    }

    #[test]
    fn done_requires_done_ts() {
        let errors = validate_task(&meta(&[("status", json!("done"))]));
        assert!(errors.iter().any(|e| e.contains("done_ts")));
    }

    #[test]
    fn estimate_grammar() {
        for good in ["2h", "30m", "1d", "1.5h"] {
            assert!(validate_task(&meta(&[("estimate", json!(good))])).is_empty(), "{good}");
        }
        for bad in ["2 hours", "h2", "1.5", "2w"] {
            assert!(!validate_task(&meta(&[("estimate", json!(bad))])).is_empty(), "{bad}");
        }
    }

    #[test]
    fn due_date_window() {
        let far_future = "2090-01-01T00:00:00+00:00";
        let far_past = "1990-01-01T00:00:00+00:00";
        assert!(!validate_task(&meta(&[("due_date", json!(far_future))])).is_empty());
        assert!(!validate_task(&meta(&[("due_date", json!(far_past))])).is_empty());
    }

    #[test]
    fn note_needs_category_or_tags() {
        assert!(!validate_note(&meta(&[("title", json!("n"))])).is_empty());
        assert!(validate_note(&meta(&[("category", json!("ideas"))])).is_empty());
        // Empty tags list still counts as having the key.
        assert!(validate_note(&meta(&[("tags", json!([]))])).is_empty());
    }

    #[test]
    fn event_times_must_be_ordered() {
        let errors = validate_event(&meta(&[
            ("start_time", json!("2025-01-15T15:00:00Z")),
            ("end_time", json!("2025-01-15T14:00:00Z")),
        ]));
        assert!(errors.iter().any(|e| e.contains("must be after")));

        let errors = validate_event(&meta(&[
            ("start_time", json!("2025-01-15T14:00:00Z")),
            ("end_time", json!("2025-01-15T15:00:00Z")),
        ]));
        assert!(errors.is_empty());
    }

    #[test]
    fn event_requires_start_time() {
        assert!(!validate_event(&meta(&[("title", json!("standup"))])).is_empty());
    }

    #[test]
    fn common_rejects_bad_links() {
        let errors = validate_common(&meta(&[("depends_on", json!(["task-1", "not a valid id!"]))]));
        assert_eq!(errors.len(), 1);
        let errors = validate_common(&meta(&[("depends_on", json!("task-1"))]));
        assert!(errors[0].contains("must be a list"));
    }

    #[test]
    fn common_title_bounds() {
        assert!(!validate_common(&meta(&[("title", json!("  "))])).is_empty());
        let long = "x".repeat(201);
        assert!(!validate_common(&meta(&[("title", json!(long))])).is_empty());
    }
}
