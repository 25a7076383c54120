#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-dedupe** – Event identity and idempotent consumption.
//!
//! Delivery between adapters and the kernel is at-least-once, so every event
//! carries a deterministic identity:
//! `event_id = sha256(source | external_id | normalized_payload)` where
//! normalization strips volatile fields and sorts keys. Re-publishing the
//! same logical event therefore yields the same ID, and the SQLite-backed
//! [`DedupeStore`] turns the republish into a no-op from the consumer's
//! viewpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

mod store_stats;
pub use store_stats::DedupeStats;

/// Payload fields that vary between retries and must not affect identity.
pub const VOLATILE_FIELDS: [&str; 4] = ["received_at", "processed_at", "retry_count", "trace_id"];

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced by envelope validation and the dedupe store.
#[derive(Debug, thiserror::Error)]
pub enum DedupeError {
    /// Database failure.
    #[error("dedupe store error: {0}")]
    Store(#[from] sqlx::Error),
    /// Envelope failed structural validation.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

//─────────────────────────────
//  Event identity
//─────────────────────────────

/// Canonical JSON used for hashing: volatile fields stripped, keys sorted.
///
/// `serde_json`'s map keeps keys ordered, so serialization is already
/// deterministic once the volatile fields are gone.
pub fn normalize_payload_for_hashing(payload: &serde_json::Map<String, Value>) -> String {
    let mut normalized = payload.clone();
    for field in VOLATILE_FIELDS {
        normalized.remove(field);
    }
    serde_json::to_string(&Value::Object(normalized)).unwrap_or_default()
}

/// Deterministic event ID: hex-encoded
/// `sha256(source | external_id | normalized_payload)`.
pub fn generate_event_id(
    source: &str,
    external_id: &str,
    payload: &serde_json::Map<String, Value>,
) -> String {
    let normalized = normalize_payload_for_hashing(payload);
    let combined = format!("{source}|{external_id}|{normalized}");
    let digest = Sha256::digest(combined.as_bytes());
    format!("{digest:x}")
}

//─────────────────────────────
//  Event envelope
//─────────────────────────────

/// Canonical event container exchanged between components.
///
/// Consumers must be idempotent by design; `event_id` is the dedupe key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Deterministic identity (see [`generate_event_id`]).
    pub event_id: String,
    /// Creation instant, ISO-8601 UTC.
    pub event_ts: String,
    /// Producing system (`telegram`, `gcal`, `cli`, `internal`, …).
    pub source: String,
    /// Dot-separated event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Normalized payload.
    pub payload: serde_json::Map<String, Value>,
    /// Optional producer sequence number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    /// Optional correlation ID for tracing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Additional metadata.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

/// Build an envelope: stamps `event_ts` with the current UTC instant and
/// derives `event_id` from `(source, external_id, payload)`. When
/// `external_id` is absent the payload's own `external_id` field is used.
pub fn create_event_envelope(
    source: &str,
    event_type: &str,
    payload: serde_json::Map<String, Value>,
    external_id: Option<&str>,
    seq: Option<i64>,
    correlation_id: Option<String>,
) -> EventEnvelope {
    let fallback = payload
        .get("external_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let external_id = external_id.unwrap_or(&fallback);

    EventEnvelope {
        event_id: generate_event_id(source, external_id, &payload),
        event_ts: kira_time::format_utc_iso8601(kira_time::now_utc()),
        source: source.to_string(),
        event_type: event_type.to_string(),
        payload,
        seq,
        correlation_id,
        metadata: serde_json::Map::new(),
    }
}

/// Structural validation of a wire-level envelope value. Returns all
/// violations; empty means valid.
pub fn validate_envelope_value(value: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(map) = value.as_object() else {
        return vec!["envelope must be a mapping".to_string()];
    };

    for field in ["event_id", "event_ts", "source", "type", "payload"] {
        match map.get(field) {
            None => errors.push(format!("missing required field: {field}")),
            Some(Value::Null) => errors.push(format!("field '{field}' cannot be null")),
            _ => {}
        }
    }

    if let Some(payload) = map.get("payload") {
        if !payload.is_null() && !payload.is_object() {
            errors.push("field 'payload' must be a mapping".to_string());
        }
    }

    if let Some(Value::String(ts)) = map.get("event_ts") {
        if !kira_time::is_utc_iso8601(ts) {
            errors.push(format!("event_ts must be ISO-8601 UTC (+00:00 or Z): {ts}"));
        }
    }

    if let Some(seq) = map.get("seq") {
        if !seq.is_null() && !seq.is_i64() && !seq.is_u64() {
            errors.push("field 'seq' must be an integer".to_string());
        }
    }

    if let Some(metadata) = map.get("metadata") {
        if !metadata.is_null() && !metadata.is_object() {
            errors.push("field 'metadata' must be a mapping".to_string());
        }
    }

    errors
}

/// Validate a typed envelope (timestamp discipline; the type system already
/// guarantees the rest).
pub fn validate_envelope(envelope: &EventEnvelope) -> Vec<String> {
    let mut errors = Vec::new();
    if envelope.event_id.is_empty() {
        errors.push("event_id cannot be empty".to_string());
    }
    if !kira_time::is_utc_iso8601(&envelope.event_ts) {
        errors.push(format!(
            "event_ts must be ISO-8601 UTC (+00:00 or Z): {}",
            envelope.event_ts
        ));
    }
    errors
}

//─────────────────────────────
//  Seen-event records
//─────────────────────────────

/// Row describing a previously seen event.
#[derive(Debug, Clone, PartialEq)]
pub struct SeenEvent {
    /// Deduplication key.
    pub event_id: String,
    /// First observation, ISO-8601 UTC.
    pub first_seen_ts: String,
    /// Latest observation, ISO-8601 UTC.
    pub last_seen_ts: String,
    /// Total observations including the first.
    pub seen_count: i64,
    /// Producing system, when recorded.
    pub source: Option<String>,
    /// External identifier, when recorded.
    pub external_id: Option<String>,
    /// Metadata JSON, when recorded.
    pub metadata: Option<Value>,
}

//─────────────────────────────
//  SQLite store
//─────────────────────────────

/// SQLite-backed set of seen event IDs with TTL cleanup.
#[derive(Debug, Clone)]
pub struct DedupeStore {
    pool: SqlitePool,
}

impl DedupeStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DedupeError> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// In-memory store for tests and ephemeral pipelines.
    pub async fn in_memory() -> Result<Self, DedupeError> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, DedupeError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), DedupeError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_events (
                event_id TEXT PRIMARY KEY,
                first_seen_ts TEXT NOT NULL,
                last_seen_ts TEXT NOT NULL,
                seen_count INTEGER NOT NULL DEFAULT 1,
                source TEXT,
                external_id TEXT,
                metadata TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_seen_events_first_seen ON seen_events(first_seen_ts)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Whether `event_id` has been seen before.
    pub async fn is_duplicate(&self, event_id: &str) -> Result<bool, DedupeError> {
        let row = sqlx::query("SELECT 1 FROM seen_events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Record an observation of `event_id`. Returns `true` when this is the
    /// first time (not a duplicate); duplicates bump `seen_count` and
    /// `last_seen_ts`.
    pub async fn mark_seen(
        &self,
        event_id: &str,
        source: Option<&str>,
        external_id: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<bool, DedupeError> {
        let now = kira_time::format_utc_iso8601(kira_time::now_utc());
        let metadata_json = metadata.map(|m| m.to_string());

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT seen_count FROM seen_events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&mut *tx)
            .await?;

        let first_time = if existing.is_some() {
            sqlx::query(
                "UPDATE seen_events SET last_seen_ts = ?, seen_count = seen_count + 1 WHERE event_id = ?",
            )
            .bind(&now)
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
            false
        } else {
            sqlx::query(
                r#"
                INSERT INTO seen_events
                (event_id, first_seen_ts, last_seen_ts, seen_count, source, external_id, metadata)
                VALUES (?, ?, ?, 1, ?, ?, ?)
                "#,
            )
            .bind(event_id)
            .bind(&now)
            .bind(&now)
            .bind(source)
            .bind(external_id)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await?;
            true
        };

        tx.commit().await?;
        Ok(first_time)
    }

    /// Full record for a seen event, if any.
    pub async fn get_event_info(&self, event_id: &str) -> Result<Option<SeenEvent>, DedupeError> {
        let row = sqlx::query("SELECT * FROM seen_events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| SeenEvent {
            event_id: row.get("event_id"),
            first_seen_ts: row.get("first_seen_ts"),
            last_seen_ts: row.get("last_seen_ts"),
            seen_count: row.get("seen_count"),
            source: row.get("source"),
            external_id: row.get("external_id"),
            metadata: row
                .get::<Option<String>, _>("metadata")
                .and_then(|raw| serde_json::from_str(&raw).ok()),
        }))
    }

    /// Delete records first seen more than `ttl_days` ago. Returns how many
    /// were removed.
    pub async fn cleanup_old_events(&self, ttl_days: i64) -> Result<u64, DedupeError> {
        let cutoff = kira_time::now_utc() - chrono::Duration::days(ttl_days);
        let cutoff_str = kira_time::format_utc_iso8601(cutoff);

        let result = sqlx::query("DELETE FROM seen_events WHERE first_seen_ts < ?")
            .bind(cutoff_str)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Aggregate counters over the store.
    pub async fn get_stats(&self) -> Result<DedupeStats, DedupeError> {
        store_stats::collect(&self.pool).await
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
