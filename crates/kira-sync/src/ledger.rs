//! The sync ledger: what we last observed from each remote entity.
//!
//! `remote_id → (version_seen, etag_seen, last_sync_ts, entity_id)` in
//! SQLite. The ledger answers two questions: *is this remote update an echo
//! of our own push?* and *did the remote actually change since we last
//! synced?* Remote IDs may be namespaced per source (`gcal:abc123`) since
//! two remote systems can legitimately claim the same raw ID.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::SyncError;

//─────────────────────────────
//  Entries
//─────────────────────────────

/// Ledger row for one remote entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLedgerEntry {
    /// ID in the remote system (possibly namespaced by source).
    pub remote_id: String,
    /// Last remote version we observed.
    pub version_seen: i64,
    /// Last ETag we observed.
    pub etag_seen: Option<String>,
    /// When we last synced, ISO-8601 UTC.
    pub last_sync_ts: String,
    /// Local entity the remote maps to, once known.
    pub entity_id: Option<String>,
}

/// Namespace a raw remote ID by its source system.
pub fn ledger_key(source: &str, remote_id: &str) -> String {
    format!("{source}:{remote_id}")
}

//─────────────────────────────
//  Ledger
//─────────────────────────────

/// SQLite-backed remote-state ledger.
#[derive(Debug, Clone)]
pub struct SyncLedger {
    pool: SqlitePool,
}

impl SyncLedger {
    /// Open (or create) the ledger at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
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

    /// In-memory ledger for tests.
    pub async fn in_memory() -> Result<Self, SyncError> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, SyncError> {
        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    async fn migrate(&self) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_ledger (
                remote_id TEXT PRIMARY KEY,
                version_seen INTEGER NOT NULL,
                etag_seen TEXT,
                last_sync_ts TEXT NOT NULL,
                entity_id TEXT,
                metadata TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_ledger_entity_id ON sync_ledger(entity_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Ledger entry for `remote_id`, if any.
    pub async fn get_entry(&self, remote_id: &str) -> Result<Option<SyncLedgerEntry>, SyncError> {
        let row = sqlx::query("SELECT * FROM sync_ledger WHERE remote_id = ?")
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| SyncLedgerEntry {
            remote_id: row.get("remote_id"),
            version_seen: row.get("version_seen"),
            etag_seen: row.get("etag_seen"),
            last_sync_ts: row.get("last_sync_ts"),
            entity_id: row.get("entity_id"),
        }))
    }

    /// Record what we just observed (or pushed) for `remote_id`.
    pub async fn record_sync(
        &self,
        remote_id: &str,
        version: i64,
        etag: Option<&str>,
        entity_id: Option<&str>,
    ) -> Result<(), SyncError> {
        let now = kira_time::format_utc_iso8601(kira_time::now_utc());
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO sync_ledger
            (remote_id, version_seen, etag_seen, last_sync_ts, entity_id)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(remote_id)
        .bind(version)
        .bind(etag)
        .bind(&now)
        .bind(entity_id)
        .execute(&self.pool)
        .await?;

        debug!(remote_id, version, entity_id = entity_id.unwrap_or(""), "sync recorded");
        Ok(())
    }

    /// Whether a remote update mirrors the version we already recorded.
    pub async fn is_echo(&self, remote_id: &str, remote_version: i64) -> Result<bool, SyncError> {
        Ok(self
            .get_entry(remote_id)
            .await?
            .is_some_and(|entry| entry.version_seen == remote_version))
    }

    /// Whether a remote update should be imported: never-seen remotes
    /// always import; otherwise either the version or (when provided) the
    /// ETag must differ from what the ledger recorded.
    pub async fn should_import(
        &self,
        remote_id: &str,
        remote_version: i64,
        remote_etag: Option<&str>,
    ) -> Result<bool, SyncError> {
        let Some(entry) = self.get_entry(remote_id).await? else {
            return Ok(true);
        };

        if remote_version != entry.version_seen {
            return Ok(true);
        }
        if let Some(etag) = remote_etag {
            if Some(etag) != entry.etag_seen.as_deref() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Local entity mapped to `remote_id`, if known.
    pub async fn entity_id_for(&self, remote_id: &str) -> Result<Option<String>, SyncError> {
        Ok(self.get_entry(remote_id).await?.and_then(|e| e.entity_id))
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_then_lookup() {
        let ledger = SyncLedger::in_memory().await.unwrap();
        ledger
            .record_sync("gcal:ev-1", 3, Some("etag-a"), Some("event-20250115-0900-standup"))
            .await
            .unwrap();

        let entry = ledger.get_entry("gcal:ev-1").await.unwrap().unwrap();
        assert_eq!(entry.version_seen, 3);
        assert_eq!(entry.etag_seen.as_deref(), Some("etag-a"));
        assert_eq!(entry.entity_id.as_deref(), Some("event-20250115-0900-standup"));
        assert!(kira_time::is_utc_iso8601(&entry.last_sync_ts));
    }

    #[tokio::test]
    async fn echo_suppression_after_record() {
        let ledger = SyncLedger::in_memory().await.unwrap();
        ledger.record_sync("gcal:ev-1", 3, Some("etag-a"), None).await.unwrap();

        // The remote reflecting our own push is an echo, not an import.
        assert!(ledger.is_echo("gcal:ev-1", 3).await.unwrap());
        assert!(!ledger.should_import("gcal:ev-1", 3, Some("etag-a")).await.unwrap());

        // A genuine remote change imports.
        assert!(!ledger.is_echo("gcal:ev-1", 4).await.unwrap());
        assert!(ledger.should_import("gcal:ev-1", 4, Some("etag-b")).await.unwrap());
    }

    #[tokio::test]
    async fn etag_change_alone_triggers_import() {
        let ledger = SyncLedger::in_memory().await.unwrap();
        ledger.record_sync("gcal:ev-1", 3, Some("etag-a"), None).await.unwrap();
        assert!(ledger.should_import("gcal:ev-1", 3, Some("etag-b")).await.unwrap());
        // Without an ETag to compare, same version means no import.
        assert!(!ledger.should_import("gcal:ev-1", 3, None).await.unwrap());
    }

    #[tokio::test]
    async fn unseen_remote_always_imports() {
        let ledger = SyncLedger::in_memory().await.unwrap();
        assert!(!ledger.is_echo("gcal:new", 1).await.unwrap());
        assert!(ledger.should_import("gcal:new", 1, None).await.unwrap());
    }

    #[tokio::test]
    async fn record_replaces_prior_entry() {
        let ledger = SyncLedger::in_memory().await.unwrap();
        ledger.record_sync("tg:m-1", 1, None, None).await.unwrap();
        ledger.record_sync("tg:m-1", 2, Some("e2"), Some("note-1")).await.unwrap();

        let entry = ledger.get_entry("tg:m-1").await.unwrap().unwrap();
        assert_eq!(entry.version_seen, 2);
        assert_eq!(ledger.entity_id_for("tg:m-1").await.unwrap().as_deref(), Some("note-1"));
    }

    #[tokio::test]
    async fn ledger_keys_namespace_by_source() {
        let ledger = SyncLedger::in_memory().await.unwrap();
        ledger.record_sync(&ledger_key("gcal", "shared-1"), 5, None, None).await.unwrap();
        ledger.record_sync(&ledger_key("caldav", "shared-1"), 9, None, None).await.unwrap();

        assert_eq!(
            ledger.get_entry("gcal:shared-1").await.unwrap().unwrap().version_seen,
            5
        );
        assert_eq!(
            ledger.get_entry("caldav:shared-1").await.unwrap().unwrap().version_seen,
            9
        );
    }

    #[tokio::test]
    async fn ledger_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifacts").join("sync_ledger.db");
        {
            let ledger = SyncLedger::open(&path).await.unwrap();
            ledger.record_sync("gcal:p-1", 2, None, None).await.unwrap();
            ledger.close().await;
        }
        {
            let ledger = SyncLedger::open(&path).await.unwrap();
            assert!(ledger.is_echo("gcal:p-1", 2).await.unwrap());
        }
    }
}
