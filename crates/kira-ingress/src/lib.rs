#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-ingress** – Ingress normalization and shape validation.
//!
//! Adapters canonicalize raw payloads here BEFORE anything is published to
//! the bus: each source has a fixed field mapping and an `external_id`
//! convention, and malformed payloads are rejected with a structured
//! warning. Invalid ingress never reaches consumers.

use serde_json::{Map, Value};
use tracing::{debug, warn};

type Payload = Map<String, Value>;

//─────────────────────────────
//  Result type
//─────────────────────────────

/// Outcome of normalizing one ingress payload.
#[derive(Debug, Clone)]
pub struct IngressResult {
    /// Whether the payload passed shape validation.
    pub valid: bool,
    /// Canonical payload, present when valid.
    pub normalized: Option<Payload>,
    /// Shape violations, present when invalid.
    pub errors: Vec<String>,
    /// Source the payload claimed.
    pub source: String,
}

impl IngressResult {
    fn accepted(source: &str, normalized: Payload) -> Self {
        Self {
            valid: true,
            normalized: Some(normalized),
            errors: Vec::new(),
            source: source.to_string(),
        }
    }
}

//─────────────────────────────
//  Validator
//─────────────────────────────

/// Stateful validator tracking accepted/rejected counts.
#[derive(Debug, Default)]
pub struct IngressValidator {
    accepted: u64,
    rejected: u64,
}

/// Counters over a validator's lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IngressStats {
    /// Payloads that passed.
    pub accepted: u64,
    /// Payloads that were dropped.
    pub rejected: u64,
    /// `rejected / (accepted + rejected)`, 0 when nothing processed.
    pub rejection_rate: f64,
}

impl IngressValidator {
    /// Fresh validator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and canonicalize one payload from `source`.
    ///
    /// Known sources get their specific mapping; anything else goes through
    /// the generic path, which requires a `type` field.
    pub fn validate_and_normalize(&mut self, source: &str, payload: &Value) -> IngressResult {
        let Some(map) = payload.as_object() else {
            return self.reject(source, &[format!("payload must be a mapping, got {payload:?}")]);
        };

        let result = match source {
            "telegram" => IngressResult::accepted(source, normalize_telegram_payload(map)),
            "gcal" => IngressResult::accepted(source, normalize_gcal_payload(map)),
            "cli" => IngressResult::accepted(source, normalize_cli_payload(map)),
            _ => {
                if map.contains_key("type") {
                    let mut normalized = map.clone();
                    normalized
                        .entry("source".to_string())
                        .or_insert_with(|| Value::String(source.to_string()));
                    IngressResult::accepted(source, normalized)
                } else {
                    return self.reject(source, &["missing required field: type".to_string()]);
                }
            }
        };

        self.accepted += 1;
        if let Some(normalized) = &result.normalized {
            debug!(
                source,
                external_id = normalized.get("external_id").and_then(serde_json::Value::as_str).unwrap_or(""),
                "ingress normalized"
            );
        }
        result
    }

    fn reject(&mut self, source: &str, errors: &[String]) -> IngressResult {
        self.rejected += 1;
        warn!(source, errors = ?errors, "rejected ingress payload");
        IngressResult {
            valid: false,
            normalized: None,
            errors: errors.to_vec(),
            source: source.to_string(),
        }
    }

    /// Accepted/rejected counters.
    pub fn stats(&self) -> IngressStats {
        let total = self.accepted + self.rejected;
        IngressStats {
            accepted: self.accepted,
            rejected: self.rejected,
            rejection_rate: if total > 0 {
                self.rejected as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

//─────────────────────────────
//  Per-source canonical shapes
//─────────────────────────────

/// Telegram message → `{text, message_id, date, user_id, username,
/// first_name, source, type, external_id}`.
pub fn normalize_telegram_payload(payload: &Payload) -> Payload {
    let mut normalized = Payload::new();

    if let Some(Value::Object(message)) = payload.get("message") {
        normalized.insert(
            "text".into(),
            message.get("text").cloned().unwrap_or(Value::String(String::new())),
        );
        if let Some(id) = message.get("message_id") {
            normalized.insert("message_id".into(), id.clone());
        }
        if let Some(date) = message.get("date") {
            normalized.insert("date".into(), date.clone());
        }
        if let Some(Value::Object(from)) = message.get("from") {
            if let Some(user_id) = from.get("id") {
                normalized.insert("user_id".into(), user_id.clone());
            }
            for key in ["username", "first_name"] {
                if let Some(value) = from.get(key) {
                    normalized.insert(key.into(), value.clone());
                }
            }
        }
    }

    normalized.insert("source".into(), Value::String("telegram".into()));
    normalized.insert("type".into(), Value::String("message".into()));

    if let Some(message_id) = normalized.get("message_id") {
        let id = match message_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        normalized.insert("external_id".into(), Value::String(format!("tg-{id}")));
    }

    normalized
}

/// Google Calendar event → `{title, description, location, start_time,
/// end_time, attendees, source, type, external_id}`.
pub fn normalize_gcal_payload(payload: &Payload) -> Payload {
    let mut normalized = Payload::new();

    normalized.insert(
        "title".into(),
        payload.get("summary").cloned().unwrap_or(Value::String(String::new())),
    );
    for key in ["description", "location"] {
        if let Some(value) = payload.get(key) {
            normalized.insert(key.into(), value.clone());
        }
    }

    // dateTime for timed events, date for all-day ones.
    for (target, source_key) in [("start_time", "start"), ("end_time", "end")] {
        if let Some(Value::Object(time)) = payload.get(source_key) {
            if let Some(value) = time.get("dateTime").or_else(|| time.get("date")) {
                normalized.insert(target.into(), value.clone());
            }
        }
    }

    if let Some(Value::Array(attendees)) = payload.get("attendees") {
        let emails: Vec<Value> = attendees
            .iter()
            .filter_map(|a| a.get("email"))
            .filter(|e| e.is_string())
            .cloned()
            .collect();
        normalized.insert("attendees".into(), Value::Array(emails));
    }

    normalized.insert("source".into(), Value::String("gcal".into()));
    normalized.insert("type".into(), Value::String("event".into()));

    if let Some(Value::String(id)) = payload.get("id") {
        normalized.insert("external_id".into(), Value::String(format!("gcal-{id}")));
    }

    normalized
}

/// CLI payload passes through; `type` becomes `cli.<command>` and a
/// timestamp-derived `external_id` is stamped when available.
pub fn normalize_cli_payload(payload: &Payload) -> Payload {
    let mut normalized = payload.clone();

    normalized
        .entry("source".to_string())
        .or_insert_with(|| Value::String("cli".into()));

    match normalized.get("command").and_then(Value::as_str) {
        Some(command) => {
            let event_type = format!("cli.{command}");
            normalized.insert("type".into(), Value::String(event_type));
        }
        None => {
            normalized
                .entry("type".to_string())
                .or_insert_with(|| Value::String("cli.unknown".into()));
        }
    }

    if let Some(timestamp) = normalized.get("timestamp").cloned() {
        let ts = match timestamp {
            Value::String(s) => s,
            other => other.to_string(),
        };
        normalized
            .entry("external_id".to_string())
            .or_insert_with(|| Value::String(format!("cli-{ts}")));
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn telegram_mapping_extracts_message_fields() {
        let mut validator = IngressValidator::new();
        let payload = json!({
            "message": {
                "text": "buy milk",
                "message_id": 42,
                "date": 1736951400,
                "from": {"id": 7, "username": "ada", "first_name": "Ada"},
            }
        });

        let result = validator.validate_and_normalize("telegram", &payload);
        assert!(result.valid);
        let normalized = result.normalized.unwrap();
        assert_eq!(normalized["text"], "buy milk");
        assert_eq!(normalized["message_id"], 42);
        assert_eq!(normalized["user_id"], 7);
        assert_eq!(normalized["username"], "ada");
        assert_eq!(normalized["source"], "telegram");
        assert_eq!(normalized["type"], "message");
        assert_eq!(normalized["external_id"], "tg-42");
    }

    #[test]
    fn gcal_mapping_handles_timed_and_all_day() {
        let mut validator = IngressValidator::new();
        let timed = json!({
            "id": "abc123",
            "summary": "Standup",
            "location": "Room 1",
            "start": {"dateTime": "2025-01-15T09:00:00+00:00"},
            "end": {"dateTime": "2025-01-15T09:30:00+00:00"},
            "attendees": [{"email": "a@example.com"}, {"displayName": "no email"}],
        });

        let result = validator.validate_and_normalize("gcal", &timed);
        let normalized = result.normalized.unwrap();
        assert_eq!(normalized["title"], "Standup");
        assert_eq!(normalized["start_time"], "2025-01-15T09:00:00+00:00");
        assert_eq!(normalized["attendees"], json!(["a@example.com"]));
        assert_eq!(normalized["external_id"], "gcal-abc123");

        let all_day = json!({
            "id": "d1",
            "summary": "Conference",
            "start": {"date": "2025-02-01"},
            "end": {"date": "2025-02-02"},
        });
        let result = validator.validate_and_normalize("gcal", &all_day);
        let normalized = result.normalized.unwrap();
        assert_eq!(normalized["start_time"], "2025-02-01");
        assert_eq!(normalized["end_time"], "2025-02-02");
    }

    #[test]
    fn cli_command_becomes_dotted_type() {
        let mut validator = IngressValidator::new();
        let payload = json!({"command": "today", "timestamp": "2025-01-15T14:30:00Z"});

        let result = validator.validate_and_normalize("cli", &payload);
        let normalized = result.normalized.unwrap();
        assert_eq!(normalized["type"], "cli.today");
        assert_eq!(normalized["external_id"], "cli-2025-01-15T14:30:00Z");
        assert_eq!(normalized["source"], "cli");
    }

    #[test]
    fn cli_without_command_is_unknown() {
        let mut validator = IngressValidator::new();
        let result = validator.validate_and_normalize("cli", &json!({"args": []}));
        assert_eq!(result.normalized.unwrap()["type"], "cli.unknown");
    }

    #[test]
    fn generic_source_requires_type() {
        let mut validator = IngressValidator::new();

        let rejected = validator.validate_and_normalize("webhook", &json!({"data": 1}));
        assert!(!rejected.valid);
        assert!(rejected.errors[0].contains("type"));
        assert!(rejected.normalized.is_none());

        let accepted = validator.validate_and_normalize("webhook", &json!({"type": "file.dropped"}));
        assert!(accepted.valid);
        assert_eq!(accepted.normalized.unwrap()["source"], "webhook");
    }

    #[test]
    fn non_mapping_payload_is_rejected() {
        let mut validator = IngressValidator::new();
        let result = validator.validate_and_normalize("telegram", &json!(["not", "a", "map"]));
        assert!(!result.valid);
        assert!(result.errors[0].contains("mapping"));
    }

    #[test]
    fn stats_track_rejection_rate() {
        let mut validator = IngressValidator::new();
        validator.validate_and_normalize("generic", &json!({"type": "a"}));
        validator.validate_and_normalize("generic", &json!({"no_type": true}));

        let stats = validator.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 1);
        assert!((stats.rejection_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn telegram_without_message_still_normalizes_shape() {
        let mut validator = IngressValidator::new();
        let result = validator.validate_and_normalize("telegram", &json!({}));
        let normalized = result.normalized.unwrap();
        assert_eq!(normalized["source"], "telegram");
        assert!(!normalized.contains_key("external_id"));
    }
}
