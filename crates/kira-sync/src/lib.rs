#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-sync** – The two-way sync substrate.
//!
//! Two cooperating pieces keep the vault and remote systems convergent
//! without echo loops:
//!
//! - the [`contract`] module owns the `x-kira` front-matter block (write
//!   provenance, monotonic version, remote ID, last-write timestamp, ETag);
//! - the [`ledger`] module owns the SQLite table recording, per remote
//!   entity, the last version and ETag we observed.
//!
//! On receiving a remote update the flow is: `should_import?` → no means
//! echo, drop it; yes means import, then `record_sync`. When both sides
//! changed since the last sync, [`contract::resolve_conflict`] applies
//! latest-wins over `last_write_ts`; exact ties are reported and default to
//! keeping local state.

pub mod contract;
pub mod ledger;

pub use contract::{
    get_sync_contract, is_origin, resolve_conflict, stamp_kira_write, stamp_remote_import,
    sync_version, update_sync_contract, ConflictResolution, SyncContract, SyncSource, X_KIRA,
};
pub use ledger::{ledger_key, SyncLedger, SyncLedgerEntry};

/// Errors produced by the sync substrate.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Ledger database failure.
    #[error("sync ledger error: {0}")]
    Ledger(#[from] sqlx::Error),
}
