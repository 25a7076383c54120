#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-quarantine** – Persistence for rejected inputs.
//!
//! Every validation failure produces a quarantined artifact under
//! `<vault>/artifacts/quarantine/` carrying the original payload, the
//! collected errors, and a high-level reason. The directory is append-only
//! from the core; TTL cleanup is the only deletion path.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced while persisting or listing quarantine records.
#[derive(Debug, thiserror::Error)]
pub enum QuarantineError {
    /// Filesystem failure.
    #[error("quarantine I/O failed for {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// OS-level error.
        #[source]
        source: std::io::Error,
    },
    /// A record file exists but is not valid JSON.
    #[error("corrupt quarantine record {path}: {reason}")]
    Corrupt {
        /// Offending file.
        path: PathBuf,
        /// Parse failure.
        reason: String,
    },
}

//─────────────────────────────
//  Records
//─────────────────────────────

/// Persisted record of a rejected payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// When the payload was quarantined (ISO-8601 UTC).
    pub timestamp: String,
    /// Entity kind (or ingress source) the payload claimed to be.
    pub kind: String,
    /// High-level reason for rejection.
    pub reason: String,
    /// Collected validation errors.
    pub errors: Vec<String>,
    /// The rejected payload, unmodified.
    pub payload: Value,
    /// Bookkeeping: quarantine time and payload size.
    #[serde(default)]
    pub metadata: Value,
    /// Where the record lives on disk. Not serialized into the file itself.
    #[serde(skip)]
    pub file_path: PathBuf,
}

/// Append-only store of rejected payloads under a quarantine directory.
#[derive(Debug, Clone)]
pub struct QuarantineStore {
    dir: PathBuf,
}

impl QuarantineStore {
    /// Store rooted at `dir` (usually `<vault>/artifacts/quarantine`).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Quarantine directory root.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a rejected payload. The filename encodes kind, a
    /// microsecond-resolution timestamp, and a sanitized payload ID so
    /// records sort chronologically in a directory listing.
    pub fn quarantine(
        &self,
        kind: &str,
        payload: Value,
        errors: Vec<String>,
        reason: &str,
    ) -> Result<QuarantineRecord, QuarantineError> {
        fs::create_dir_all(&self.dir).map_err(|source| QuarantineError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let now = kira_time::now_utc();
        let timestamp = kira_time::format_utc_iso8601(now);
        let compact = now.format("%Y%m%d_%H%M%S_%6f").to_string();

        let payload_id = payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let safe_id: String = payload_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(50)
            .collect();

        let file_path = self.dir.join(format!("{kind}_{compact}_{safe_id}.json"));

        let payload_size = serde_json::to_string(&payload).map(|s| s.len()).unwrap_or(0);
        let record = QuarantineRecord {
            timestamp: timestamp.clone(),
            kind: kind.to_string(),
            reason: reason.to_string(),
            errors,
            payload,
            metadata: serde_json::json!({
                "quarantined_at_utc": timestamp,
                "payload_size_bytes": payload_size,
            }),
            file_path: file_path.clone(),
        };

        let body = serde_json::to_string_pretty(&record).map_err(|e| QuarantineError::Corrupt {
            path: file_path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&file_path, body).map_err(|source| QuarantineError::Io {
            path: file_path.clone(),
            source,
        })?;

        warn!(kind, reason, path = %file_path.display(), "payload quarantined");
        Ok(record)
    }

    /// List quarantined records, newest first, optionally filtered by kind
    /// and capped at `limit`. Corrupt files are skipped.
    pub fn list(
        &self,
        kind: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<QuarantineRecord>, QuarantineError> {
        let mut records = self.read_all()?;
        if let Some(kind) = kind {
            records.retain(|r| r.kind == kind);
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Delete records older than `ttl_days`. Returns how many were removed.
    pub fn cleanup_old(&self, ttl_days: i64) -> Result<usize, QuarantineError> {
        let cutoff = kira_time::now_utc() - Duration::days(ttl_days);
        let mut deleted = 0usize;

        for record in self.read_all()? {
            let Ok(quarantined_at) = record.timestamp.parse::<DateTime<Utc>>() else {
                continue;
            };
            if quarantined_at < cutoff {
                fs::remove_file(&record.file_path).map_err(|source| QuarantineError::Io {
                    path: record.file_path.clone(),
                    source,
                })?;
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    /// Record counts, total and per kind.
    pub fn stats(&self) -> Result<QuarantineStats, QuarantineError> {
        let records = self.read_all()?;
        let mut by_kind = std::collections::HashMap::new();
        for record in &records {
            *by_kind.entry(record.kind.clone()).or_insert(0usize) += 1;
        }
        Ok(QuarantineStats { total: records.len(), by_kind })
    }

    fn read_all(&self) -> Result<Vec<QuarantineRecord>, QuarantineError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|source| QuarantineError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&path) else { continue };
            match serde_json::from_str::<QuarantineRecord>(&raw) {
                Ok(mut record) => {
                    record.file_path = path;
                    records.push(record);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt quarantine record");
                }
            }
        }
        Ok(records)
    }
}

/// Counters over the quarantine directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineStats {
    /// Records present.
    pub total: usize,
    /// Records per claimed kind.
    pub by_kind: std::collections::HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quarantine_writes_record_with_reason_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(dir.path());

        let record = store
            .quarantine(
                "task",
                json!({"id": "task-1", "title": ""}),
                vec!["title cannot be empty".to_string()],
                "validation failed",
            )
            .unwrap();

        assert!(record.file_path.exists());
        let raw = fs::read_to_string(&record.file_path).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["kind"], "task");
        assert_eq!(parsed["reason"], "validation failed");
        assert_eq!(parsed["errors"][0], "title cannot be empty");
        assert_eq!(parsed["payload"]["id"], "task-1");
    }

    #[test]
    fn filename_encodes_kind_and_safe_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(dir.path());
        let record = store
            .quarantine("note", json!({"id": "note/../evil"}), vec![], "bad id")
            .unwrap();
        let name = record.file_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("note_"));
        assert!(!name.contains('/'));
    }

    #[test]
    fn list_filters_by_kind_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(dir.path());
        store.quarantine("task", json!({"id": "task-1"}), vec![], "r").unwrap();
        store.quarantine("note", json!({"id": "note-1"}), vec![], "r").unwrap();
        store.quarantine("task", json!({"id": "task-2"}), vec![], "r").unwrap();

        let tasks = store.list(Some("task"), None).unwrap();
        assert_eq!(tasks.len(), 2);
        let capped = store.list(None, Some(1)).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn cleanup_removes_only_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(dir.path());
        let record = store.quarantine("task", json!({"id": "task-1"}), vec![], "r").unwrap();

        // Fresh record survives a 30-day TTL.
        assert_eq!(store.cleanup_old(30).unwrap(), 0);

        // Backdate the stored timestamp to force expiry.
        let raw = fs::read_to_string(&record.file_path).unwrap();
        let aged = raw.replace(&record.timestamp, "2000-01-01T00:00:00+00:00");
        fs::write(&record.file_path, aged).unwrap();
        assert_eq!(store.cleanup_old(30).unwrap(), 1);
        assert!(store.list(None, None).unwrap().is_empty());
    }

    #[test]
    fn stats_count_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(dir.path());
        store.quarantine("task", json!({}), vec![], "r").unwrap();
        store.quarantine("task", json!({}), vec![], "r").unwrap();
        store.quarantine("event", json!({}), vec![], "r").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_kind["task"], 2);
        assert_eq!(stats.by_kind["event"], 1);
    }

    #[test]
    fn empty_store_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::new(dir.path().join("missing"));
        assert!(store.list(None, None).unwrap().is_empty());
        assert_eq!(store.cleanup_old(30).unwrap(), 0);
    }
}
