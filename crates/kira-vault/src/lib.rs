#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-vault** – The single-writer discipline.
//!
//! All entity mutations travel through this gateway; no code outside it may
//! open an entity file for write. Each mutation takes a per-entity advisory
//! file lock under `<vault>/.kira/locks/<id>.lock` (OS `flock` semantics via
//! `fs2`), delegates to the Host API for validation, link maintenance and
//! event emission, and releases the lock on every exit path via an RAII
//! guard. Writes to the same entity serialize through the lock; different
//! entities mutate in parallel.
//!
//! Lock acquisition blocks up to a configurable timeout (default 10 s) and
//! then fails with [`VaultError::LockTimeout`]; the operation is safe to
//! retry.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use kira_host::{Entity, EntityLinks, HostApi, HostError};
use kira_types::{EntityKind, Metadata};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by vault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The per-entity lock could not be acquired in time. Retryable.
    #[error("timed out acquiring lock for {entity_id} after {waited:?}")]
    LockTimeout {
        /// Entity whose lock was contended.
        entity_id: String,
        /// How long acquisition was attempted.
        waited: Duration,
    },
    /// Lock file could not be created or locked.
    #[error("lock I/O failed for {path}: {source}")]
    LockIo {
        /// Lock file path.
        path: PathBuf,
        /// OS-level error.
        #[source]
        source: std::io::Error,
    },
    /// Host API failure (validation, not-found, I/O, …).
    #[error(transparent)]
    Host(#[from] HostError),
}

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Vault gateway configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Maximum time to wait for a contended entity lock.
    pub lock_timeout: Duration,
    /// Poll interval while waiting for a lock.
    pub lock_poll_interval: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(50),
        }
    }
}

//─────────────────────────────
//  Lock guard
//─────────────────────────────

/// Held advisory lock on one entity. Unlocks on drop.
struct EntityLock {
    file: File,
    entity_id: String,
}

impl Drop for EntityLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(entity_id = %self.entity_id, error = %err, "failed to release entity lock");
        }
        debug!(entity_id = %self.entity_id, "entity lock released");
    }
}

//─────────────────────────────
//  Vault
//─────────────────────────────

/// Single-writer gateway over a [`HostApi`].
pub struct Vault {
    host: HostApi,
    config: VaultConfig,
    locks_dir: PathBuf,
}

impl Vault {
    /// Wrap a host with the default lock configuration.
    pub fn new(host: HostApi) -> Self {
        Self::with_config(host, VaultConfig::default())
    }

    /// Wrap a host with explicit lock configuration.
    pub fn with_config(host: HostApi, config: VaultConfig) -> Self {
        let locks_dir = host.vault_path().join(".kira").join("locks");
        Self { host, config, locks_dir }
    }

    /// The underlying Host API (reads and diagnostics; mutations must go
    /// through the vault).
    pub fn host(&self) -> &HostApi {
        &self.host
    }

    async fn acquire_lock(&self, entity_id: &str) -> Result<EntityLock, VaultError> {
        std::fs::create_dir_all(&self.locks_dir).map_err(|source| VaultError::LockIo {
            path: self.locks_dir.clone(),
            source,
        })?;

        let lock_path = self.locks_dir.join(format!("{entity_id}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| VaultError::LockIo { path: lock_path.clone(), source })?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(entity_id, waited = ?started.elapsed(), "entity lock acquired");
                    return Ok(EntityLock { file, entity_id: entity_id.to_string() });
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if started.elapsed() >= self.config.lock_timeout {
                        return Err(VaultError::LockTimeout {
                            entity_id: entity_id.to_string(),
                            waited: started.elapsed(),
                        });
                    }
                    tokio::time::sleep(self.config.lock_poll_interval).await;
                }
                Err(source) => {
                    return Err(VaultError::LockIo { path: lock_path, source });
                }
            }
        }
    }

    //─────────────────────────────
    //  Operations
    //─────────────────────────────

    /// Create an entity under its lock.
    pub async fn create(
        &self,
        kind: EntityKind,
        data: Metadata,
        content: &str,
    ) -> Result<Entity, VaultError> {
        let mut data = data;
        let entity_id = self.host.ensure_id(kind, &mut data)?;
        let _lock = self.acquire_lock(&entity_id).await?;
        Ok(self.host.create_entity(kind, data, content).await?)
    }

    /// Read an entity. Reads are lock-free; the atomic write discipline
    /// guarantees a parseable file at every point in time.
    pub fn get(&self, entity_id: &str) -> Result<Entity, VaultError> {
        Ok(self.host.read_entity(entity_id)?)
    }

    /// Update an entity under its lock.
    pub async fn update(
        &self,
        entity_id: &str,
        updates: Metadata,
        content: Option<&str>,
    ) -> Result<Entity, VaultError> {
        let _lock = self.acquire_lock(entity_id).await?;
        Ok(self.host.update_entity(entity_id, updates, content).await?)
    }

    /// Delete an entity under its lock.
    pub async fn delete(&self, entity_id: &str) -> Result<(), VaultError> {
        let _lock = self.acquire_lock(entity_id).await?;
        Ok(self.host.delete_entity(entity_id).await?)
    }

    /// Create-or-update under the entity lock.
    pub async fn upsert(
        &self,
        kind: EntityKind,
        data: Metadata,
        content: &str,
    ) -> Result<Entity, VaultError> {
        let mut data = data;
        let entity_id = self.host.ensure_id(kind, &mut data)?;
        let _lock = self.acquire_lock(&entity_id).await?;
        Ok(self.host.upsert_entity(kind, data, content).await?)
    }

    /// List entities (lock-free).
    pub fn list(
        &self,
        kind: Option<EntityKind>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Entity>, VaultError> {
        Ok(self.host.list_entities(kind, limit, offset)?)
    }

    /// Link information for an entity (lock-free).
    pub fn links(&self, entity_id: &str) -> Result<EntityLinks, VaultError> {
        Ok(self.host.get_entity_links(entity_id)?)
    }
}
