//! The sync contract embedded in entity front-matter.
//!
//! The `x-kira` block records the provenance and version of the last write:
//! every Kira-originated write sets `source = "kira"` and bumps the version;
//! every remote import sets the remote source, bumps the version, and
//! records the remote ID and ETag. Together with the ledger this prevents
//! echo loops and drives conflict resolution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use kira_types::Metadata;

/// Front-matter key carrying the sync contract.
pub const X_KIRA: &str = "x-kira";

//─────────────────────────────
//  Sync sources
//─────────────────────────────

/// Origin of the last write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
    /// The vault itself.
    Kira,
    /// Google Calendar.
    Gcal,
    /// Telegram adapter.
    Telegram,
    /// Any other remote system.
    Other,
}

impl SyncSource {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncSource::Kira => "kira",
            SyncSource::Gcal => "gcal",
            SyncSource::Telegram => "telegram",
            SyncSource::Other => "other",
        }
    }

    /// Parse, mapping unknown names to [`SyncSource::Other`].
    pub fn parse(value: &str) -> Self {
        match value {
            "kira" => SyncSource::Kira,
            "gcal" => SyncSource::Gcal,
            "telegram" => SyncSource::Telegram,
            _ => SyncSource::Other,
        }
    }
}

impl fmt::Display for SyncSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Contract
//─────────────────────────────

/// Parsed `x-kira` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncContract {
    /// Origin of the last write.
    pub source: SyncSource,
    /// Monotonic write counter, starting at 1.
    pub version: i64,
    /// ID in the remote system, once synced.
    pub remote_id: Option<String>,
    /// Timestamp of the last write, ISO-8601 UTC.
    pub last_write_ts: Option<String>,
    /// ETag from the remote system, for optimistic locking.
    pub etag: Option<String>,
}

impl SyncContract {
    /// Render as the `x-kira` metadata value; absent fields are omitted.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("source".into(), Value::String(self.source.as_str().into()));
        map.insert("version".into(), Value::from(self.version));
        if let Some(remote_id) = &self.remote_id {
            map.insert("remote_id".into(), Value::String(remote_id.clone()));
        }
        if let Some(last_write_ts) = &self.last_write_ts {
            map.insert("last_write_ts".into(), Value::String(last_write_ts.clone()));
        }
        if let Some(etag) = &self.etag {
            map.insert("etag".into(), Value::String(etag.clone()));
        }
        Value::Object(map)
    }

    /// Parse an `x-kira` value; tolerant of partial blocks.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if !map.contains_key("source") && !map.contains_key("version") {
            return None;
        }
        Some(Self {
            source: map
                .get("source")
                .and_then(Value::as_str)
                .map(SyncSource::parse)
                .unwrap_or(SyncSource::Kira),
            version: map.get("version").and_then(Value::as_i64).unwrap_or(0),
            remote_id: map.get("remote_id").and_then(Value::as_str).map(str::to_string),
            last_write_ts: map
                .get("last_write_ts")
                .and_then(Value::as_str)
                .map(str::to_string),
            etag: map.get("etag").and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// Contract from entity metadata, if any.
pub fn get_sync_contract(metadata: &Metadata) -> Option<SyncContract> {
    metadata.get(X_KIRA).and_then(SyncContract::from_value)
}

/// Current sync version (0 when no contract).
pub fn sync_version(metadata: &Metadata) -> i64 {
    get_sync_contract(metadata).map(|c| c.version).unwrap_or(0)
}

/// Whether the last write originated from `source`.
pub fn is_origin(metadata: &Metadata, source: SyncSource) -> bool {
    get_sync_contract(metadata).is_some_and(|c| c.source == source)
}

/// Bump the contract for a new write: increment the version, refresh
/// `last_write_ts`, record the origin. `remote_id` is preserved from the
/// prior contract unless a new one is supplied; the ETag is replaced.
pub fn update_sync_contract(
    metadata: &Metadata,
    source: SyncSource,
    remote_id: Option<&str>,
    etag: Option<&str>,
) -> Metadata {
    let current = get_sync_contract(metadata);
    let version = current.as_ref().map(|c| c.version).unwrap_or(0) + 1;

    let contract = SyncContract {
        source,
        version,
        remote_id: remote_id
            .map(str::to_string)
            .or_else(|| current.as_ref().and_then(|c| c.remote_id.clone())),
        last_write_ts: Some(kira_time::format_utc_iso8601(kira_time::now_utc())),
        etag: etag.map(str::to_string),
    };

    let mut updated = metadata.clone();
    updated.insert(X_KIRA.to_string(), contract.to_value());
    updated
}

/// Stamp a Kira-originated write.
pub fn stamp_kira_write(metadata: &Metadata) -> Metadata {
    update_sync_contract(metadata, SyncSource::Kira, None, None)
}

/// Stamp a remote-originated import.
pub fn stamp_remote_import(
    metadata: &Metadata,
    source: SyncSource,
    remote_id: &str,
    etag: Option<&str>,
) -> Metadata {
    update_sync_contract(metadata, source, Some(remote_id), etag)
}

//─────────────────────────────
//  Conflict resolution
//─────────────────────────────

/// Outcome of comparing both sides' last writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// The local write is newer.
    LocalWins,
    /// The remote write is newer.
    RemoteWins,
    /// Identical timestamps; policy decides (default: keep local).
    Tie,
}

/// Latest-wins over `last_write_ts` values (both ISO-8601 UTC). An
/// unparseable side loses; two unparseable sides tie.
pub fn resolve_conflict(local_ts: &str, remote_ts: &str) -> ConflictResolution {
    let local = kira_time::parse_utc_iso8601(local_ts).ok();
    let remote = kira_time::parse_utc_iso8601(remote_ts).ok();

    match (local, remote) {
        (Some(l), Some(r)) if l > r => ConflictResolution::LocalWins,
        (Some(l), Some(r)) if l < r => ConflictResolution::RemoteWins,
        (Some(_), Some(_)) => ConflictResolution::Tie,
        (Some(_), None) => ConflictResolution::LocalWins,
        (None, Some(_)) => ConflictResolution::RemoteWins,
        (None, None) => ConflictResolution::Tie,
    }
}
