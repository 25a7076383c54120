#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-host** – The Host API: the only path through which entities
//! change on disk.
//!
//! Every mutation runs the same gauntlet: ID checks → timestamp stamping →
//! validation (schema + business rules; failures are quarantined and
//! surfaced) → folder contracts → sync-contract stamping → atomic write →
//! link-graph update → event emission. Invalid entities never touch disk.
//!
//! The Host API itself does no locking; the single-writer discipline (per-
//! entity file locks) lives one layer up in `kira-vault`, which routes every
//! mutation through here.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono_tz::Tz;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use kira_bus_core::EventBus;
use kira_links::{update_entity_links, LinkGraph};
use kira_quarantine::QuarantineStore;
use kira_schemas::SchemaCache;
use kira_types::{events, EntityKind, Metadata, FALLBACK_FOLDER};

mod entity;
mod task_events;
pub use entity::Entity;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by Host API operations.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// No entity with the given ID.
    #[error("entity not found: {0}")]
    NotFound(String),
    /// Create collided with an existing ID.
    #[error("entity already exists: {0}")]
    AlreadyExists(String),
    /// Schema or business-rule validation failed; payload quarantined.
    #[error("validation failed for {entity_id}: {}", errors.join("; "))]
    Validation {
        /// Offending entity ID (may be provisional).
        entity_id: String,
        /// Collected validation errors.
        errors: Vec<String>,
    },
    /// Folder contract violated.
    #[error("folder contract violations: {}", .0.join("; "))]
    FolderContract(Vec<String>),
    /// Malformed entity ID.
    #[error(transparent)]
    InvalidId(#[from] kira_ids::IdError),
    /// Markdown read/write failure.
    #[error(transparent)]
    Io(#[from] kira_md::MdError),
    /// Quarantine persistence failure.
    #[error(transparent)]
    Quarantine(#[from] kira_quarantine::QuarantineError),
}

//─────────────────────────────
//  Link views
//─────────────────────────────

/// One edge as reported by [`HostApi::get_entity_links`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LinkRef {
    /// The other endpoint.
    pub entity_id: String,
    /// Link type.
    #[serde(rename = "type")]
    pub link_type: String,
}

/// Outgoing and incoming edges of one entity.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntityLinks {
    /// Edges from this entity.
    pub outgoing: Vec<LinkRef>,
    /// Edges pointing at this entity.
    pub incoming: Vec<LinkRef>,
}

//─────────────────────────────
//  Host API
//─────────────────────────────

/// Single point of access for all vault operations.
pub struct HostApi {
    vault_path: PathBuf,
    tz: Tz,
    bus: Arc<EventBus>,
    schemas: SchemaCache,
    quarantine: QuarantineStore,
    // Coarse per-vault lock; the graph is only touched by the Host API.
    link_graph: Mutex<LinkGraph>,
}

impl HostApi {
    /// Open a vault at `vault_path`, creating the directory skeleton and
    /// loading the link graph from existing entities.
    pub fn new(
        vault_path: impl Into<PathBuf>,
        tz: Tz,
        bus: Arc<EventBus>,
    ) -> Result<Self, HostError> {
        let vault_path = vault_path.into();
        Self::ensure_vault_structure(&vault_path)?;

        let host = Self {
            schemas: SchemaCache::new(vault_path.join(".kira").join("schemas")),
            quarantine: QuarantineStore::new(vault_path.join("artifacts").join("quarantine")),
            link_graph: Mutex::new(LinkGraph::new()),
            vault_path,
            tz,
            bus,
        };
        host.load_link_graph();
        Ok(host)
    }

    fn ensure_vault_structure(vault_path: &Path) -> Result<(), HostError> {
        let mut dirs = vec![
            vault_path.join(".kira").join("schemas"),
            vault_path.join(".kira").join("locks"),
            vault_path.join("inbox"),
            vault_path.join(FALLBACK_FOLDER),
            vault_path.join("artifacts").join("quarantine"),
        ];
        dirs.extend(EntityKind::ALL.iter().map(|k| vault_path.join(k.folder())));

        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .map_err(|source| HostError::Io(kira_md::MdError::Io { path: dir.clone(), source }))?;
        }
        Ok(())
    }

    fn load_link_graph(&self) {
        let entities = match self.list_entities(None, None, 0) {
            Ok(entities) => entities,
            Err(err) => {
                warn!(error = %err, "failed to load link graph");
                return;
            }
        };
        let mut graph = self.link_graph.lock().expect("link graph poisoned");
        for entity in entities {
            graph.add_entity(entity.id.clone());
            update_entity_links(&mut graph, &entity.id, &entity.metadata, &entity.content);
        }
    }

    /// Vault root directory.
    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }

    /// Configured local timezone.
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Quarantine store for this vault.
    pub fn quarantine(&self) -> &QuarantineStore {
        &self.quarantine
    }

    /// Fill in a generated `id` when the payload has none. The generated ID
    /// is collision-checked against the vault and suffixed when taken.
    pub fn ensure_id(&self, kind: EntityKind, data: &mut Metadata) -> Result<String, HostError> {
        if let Some(id) = data.get("id").and_then(Value::as_str) {
            kira_ids::parse_entity_id(id)?;
            return Ok(id.to_string());
        }

        let title = data
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let base = kira_ids::generate_entity_id(kind, &title, kira_time::now_utc(), self.tz);

        let mut id = base.clone();
        let mut attempt = 2u32;
        while self.entity_exists(&id) {
            if attempt > 100 {
                id = format!("{base}-{}", kira_ids::short_random_id(8));
                break;
            }
            id = format!("{base}-{attempt}");
            attempt += 1;
        }

        data.insert("id".into(), Value::String(id.clone()));
        Ok(id)
    }

    /// Whether an entity file exists for `entity_id`.
    pub fn entity_exists(&self, entity_id: &str) -> bool {
        self.entity_path(entity_id).exists()
    }

    /// On-disk path for an entity: a pure function of its ID. Kinds without
    /// a folder contract resolve under the fallback bucket (listing only —
    /// writes reject such kinds earlier).
    pub fn entity_path(&self, entity_id: &str) -> PathBuf {
        let folder = kira_ids::parse_entity_id(entity_id)
            .ok()
            .and_then(|parsed| parsed.typed_kind())
            .map(|kind| kind.folder())
            .unwrap_or(FALLBACK_FOLDER);
        self.vault_path.join(folder).join(format!("{entity_id}.md"))
    }

    fn validate_or_quarantine(
        &self,
        kind: EntityKind,
        entity_id: &str,
        data: &Metadata,
        operation: &str,
    ) -> Result<(), HostError> {
        let outcome = kira_schemas::validate_entity(&self.schemas, kind, data);
        if outcome.is_valid() {
            return Ok(());
        }

        self.quarantine.quarantine(
            kind.as_str(),
            Value::Object(data.clone()),
            outcome.errors.clone(),
            &format!("{operation} validation failed for {kind}"),
        )?;

        Err(HostError::Validation {
            entity_id: entity_id.to_string(),
            errors: outcome.errors,
        })
    }

    /// Stamp the sync contract for this write. Payloads carrying their own
    /// `x-kira` block (remote imports prepared by the sync pipeline) pass
    /// through untouched; everything else is a Kira-originated write.
    fn stamp_sync_contract(&self, data: Metadata) -> Metadata {
        if data.contains_key(kira_sync::X_KIRA) {
            data
        } else {
            kira_sync::stamp_kira_write(&data)
        }
    }

    //─────────────────────────────
    //  Operations
    //─────────────────────────────

    /// Create a new entity. The write is atomic; the link graph and an
    /// `entity.created` event follow it.
    pub async fn create_entity(
        &self,
        kind: EntityKind,
        data: Metadata,
        content: &str,
    ) -> Result<Entity, HostError> {
        let mut data = data;
        let entity_id = self.ensure_id(kind, &mut data)?;

        if self.entity_exists(&entity_id) {
            return Err(HostError::AlreadyExists(entity_id));
        }

        // Stamp timestamps before validation so the strict layer sees them.
        let now = kira_time::now_utc();
        let now_str = kira_time::format_utc_iso8601(now);
        data.entry("created".to_string())
            .or_insert_with(|| Value::String(now_str.clone()));
        data.insert("updated".into(), Value::String(now_str));

        self.validate_or_quarantine(kind, &entity_id, &data, "create")?;

        let violations = self.schemas.folder_contract_violations(kind, &data);
        if !violations.is_empty() {
            return Err(HostError::FolderContract(violations));
        }

        let data = self.stamp_sync_contract(data);
        let created_at = data
            .get("created")
            .and_then(Value::as_str)
            .and_then(|s| kira_time::parse_utc_iso8601(s).ok())
            .unwrap_or(now);

        let mut entity = Entity {
            id: entity_id.clone(),
            kind,
            metadata: data,
            content: content.to_string(),
            path: None,
            created_at,
            updated_at: now,
        };

        let file_path = self.entity_path(&entity_id);
        kira_md::write_markdown(&file_path, &entity.to_markdown())?;
        entity.path = Some(file_path.clone());

        {
            let mut graph = self.link_graph.lock().expect("link graph poisoned");
            graph.add_entity(entity_id.clone());
            update_entity_links(&mut graph, &entity_id, &entity.metadata, &entity.content);
        }

        self.bus
            .publish(
                events::ENTITY_CREATED,
                json!({
                    "entity_id": entity_id,
                    "kind": kind.as_str(),
                    "path": file_path.to_string_lossy(),
                    "metadata": Value::Object(entity.metadata.clone()),
                }),
            )
            .await;
        task_events::emit_task_created(&self.bus, &entity).await;
        task_events::emit_status_transition(&self.bus, &entity, None).await;

        info!(entity_id = %entity.id, kind = %kind, path = %file_path.display(), "entity created");
        Ok(entity)
    }

    /// Read an entity by ID.
    pub fn read_entity(&self, entity_id: &str) -> Result<Entity, HostError> {
        kira_ids::parse_entity_id(entity_id)?;
        let file_path = self.entity_path(entity_id);
        if !file_path.exists() {
            return Err(HostError::NotFound(entity_id.to_string()));
        }
        let document = kira_md::read_markdown(&file_path)?;
        Entity::from_markdown(entity_id, document, Some(&file_path))
    }

    /// Apply metadata updates (and optionally new content) to an existing
    /// entity. `updated` is stamped unconditionally; invalid updates are
    /// quarantined and rejected, leaving the prior version on disk.
    pub async fn update_entity(
        &self,
        entity_id: &str,
        updates: Metadata,
        content: Option<&str>,
    ) -> Result<Entity, HostError> {
        let mut entity = self.read_entity(entity_id)?;
        let previous_status = entity
            .metadata
            .get("status")
            .or_else(|| entity.metadata.get("state"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let changed_keys: Vec<String> = updates.keys().cloned().collect();
        let mut new_metadata = entity.metadata.clone();
        for (key, value) in updates {
            new_metadata.insert(key, value);
        }

        let now = kira_time::now_utc();
        new_metadata.insert(
            "updated".into(),
            Value::String(kira_time::format_utc_iso8601(now)),
        );

        self.validate_or_quarantine(entity.kind, entity_id, &new_metadata, "update")?;

        entity.metadata = self.stamp_sync_contract(new_metadata);
        if let Some(content) = content {
            entity.content = content.to_string();
        }
        entity.updated_at = now;

        let file_path = self.entity_path(entity_id);
        kira_md::write_markdown(&file_path, &entity.to_markdown())?;
        entity.path = Some(file_path.clone());

        {
            let mut graph = self.link_graph.lock().expect("link graph poisoned");
            update_entity_links(&mut graph, entity_id, &entity.metadata, &entity.content);
        }

        self.bus
            .publish(
                events::ENTITY_UPDATED,
                json!({
                    "entity_id": entity_id,
                    "kind": entity.kind.as_str(),
                    "path": file_path.to_string_lossy(),
                    "changes": changed_keys,
                }),
            )
            .await;
        task_events::emit_status_transition(&self.bus, &entity, previous_status.as_deref()).await;

        info!(entity_id, "entity updated");
        Ok(entity)
    }

    /// Delete an entity: removes its file and every adjacent link, then
    /// emits `entity.deleted`.
    pub async fn delete_entity(&self, entity_id: &str) -> Result<(), HostError> {
        let entity = self.read_entity(entity_id)?;

        let removed_links = {
            let mut graph = self.link_graph.lock().expect("link graph poisoned");
            graph.remove_entity(entity_id)
        };

        let file_path = self.entity_path(entity_id);
        std::fs::remove_file(&file_path)
            .map_err(|source| HostError::Io(kira_md::MdError::Io { path: file_path.clone(), source }))?;

        self.bus
            .publish(
                events::ENTITY_DELETED,
                json!({
                    "entity_id": entity_id,
                    "kind": entity.kind.as_str(),
                    "path": file_path.to_string_lossy(),
                }),
            )
            .await;

        info!(entity_id, removed_links = removed_links.len(), "entity deleted");
        Ok(())
    }

    /// List entities, optionally filtered by kind, with limit/offset
    /// pagination. Malformed files are skipped.
    pub fn list_entities(
        &self,
        kind: Option<EntityKind>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Entity>, HostError> {
        let folders: Vec<&str> = match kind {
            Some(kind) => vec![kind.folder()],
            None => EntityKind::ALL
                .iter()
                .map(|k| k.folder())
                .chain(std::iter::once(FALLBACK_FOLDER))
                .collect(),
        };

        let mut entities = Vec::new();
        let mut skipped = 0usize;

        for folder in folders {
            let folder_path = self.vault_path.join(folder);
            if !folder_path.exists() {
                continue;
            }

            let mut files: Vec<PathBuf> = std::fs::read_dir(&folder_path)
                .map_err(|source| {
                    HostError::Io(kira_md::MdError::Io { path: folder_path.clone(), source })
                })?
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
                .collect();
            files.sort();

            for file in files {
                let Ok(document) = kira_md::read_markdown(&file) else { continue };
                let Some(entity_id) = document.get_metadata_str("id").map(str::to_string) else {
                    continue;
                };
                if !kira_ids::is_valid_entity_id(&entity_id) {
                    continue;
                }
                if let Some(kind) = kind {
                    let matches = kira_ids::parse_entity_id(&entity_id)
                        .ok()
                        .and_then(|p| p.typed_kind())
                        == Some(kind);
                    if !matches {
                        continue;
                    }
                }

                if skipped < offset {
                    skipped += 1;
                    continue;
                }

                if let Ok(entity) = Entity::from_markdown(&entity_id, document, Some(&file)) {
                    entities.push(entity);
                    if limit.is_some_and(|l| entities.len() >= l) {
                        return Ok(entities);
                    }
                }
            }
        }

        Ok(entities)
    }

    /// Create the entity when its ID is new, otherwise update it.
    pub async fn upsert_entity(
        &self,
        kind: EntityKind,
        data: Metadata,
        content: &str,
    ) -> Result<Entity, HostError> {
        let existing_id = data
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| self.entity_exists(id))
            .map(str::to_string);

        match existing_id {
            Some(id) => {
                let mut updates = data;
                updates.remove("id");
                self.update_entity(&id, updates, Some(content)).await
            }
            None => self.create_entity(kind, data, content).await,
        }
    }

    /// Outgoing and incoming links of an entity.
    pub fn get_entity_links(&self, entity_id: &str) -> Result<EntityLinks, HostError> {
        if !self.entity_exists(entity_id) {
            return Err(HostError::NotFound(entity_id.to_string()));
        }

        let graph = self.link_graph.lock().expect("link graph poisoned");
        Ok(EntityLinks {
            outgoing: graph
                .outgoing(entity_id, None)
                .into_iter()
                .map(|l| LinkRef { entity_id: l.target_id, link_type: l.link_type })
                .collect(),
            incoming: graph
                .incoming(entity_id, None)
                .into_iter()
                .map(|l| LinkRef { entity_id: l.source_id, link_type: l.link_type })
                .collect(),
        })
    }

    /// Run a closure against the link graph (read-only diagnostics:
    /// orphans, cycles, broken references).
    pub fn with_link_graph<T>(&self, f: impl FnOnce(&LinkGraph) -> T) -> T {
        let graph = self.link_graph.lock().expect("link graph poisoned");
        f(&graph)
    }
}
