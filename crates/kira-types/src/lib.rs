#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-types** – Shared primitive data structures for the Kira vault kernel.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, time, or storage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

//─────────────────────────────
//  Limits
//─────────────────────────────

/// Maximum length of an entity identifier (filesystem safety).
pub const MAX_ENTITY_ID_LEN: usize = 100;

/// Maximum length of the slug portion of an entity identifier.
pub const MAX_SLUG_LEN: usize = 50;

/// Maximum length of an entity title.
pub const MAX_TITLE_LEN: usize = 200;

//─────────────────────────────
//  Metadata values
//─────────────────────────────

/// Front-matter metadata mapping: string keys to JSON-shaped values.
///
/// YAML front-matter is bridged into this representation at the I/O boundary
/// so the rest of the kernel works with one value model.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

//─────────────────────────────
//  Entity kinds
//─────────────────────────────

/// Closed set of entity kinds with a folder contract.
///
/// The kind is the prefix of every entity ID and determines where the
/// entity's Markdown file lives inside the vault. Kinds outside this set are
/// accepted by ID parsing (the original system keeps an extensible registry)
/// but list under the `processed/` fallback bucket and are never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Actionable work item with a status machine.
    Task,
    /// Free-form note.
    Note,
    /// Calendar event with a start time.
    Event,
    /// Long-running project grouping tasks.
    Project,
    /// Person or organisation.
    Contact,
    /// Meeting record.
    Meeting,
}

impl EntityKind {
    /// All kinds carrying a folder contract.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Task,
        EntityKind::Note,
        EntityKind::Event,
        EntityKind::Project,
        EntityKind::Contact,
        EntityKind::Meeting,
    ];

    /// Canonical lowercase name used as the ID prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Note => "note",
            EntityKind::Event => "event",
            EntityKind::Project => "project",
            EntityKind::Contact => "contact",
            EntityKind::Meeting => "meeting",
        }
    }

    /// Vault folder this kind lives in. Pure function of the kind.
    pub fn folder(&self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::Note => "notes",
            EntityKind::Event => "events",
            EntityKind::Project => "projects",
            EntityKind::Contact => "contacts",
            EntityKind::Meeting => "meetings",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(EntityKind::Task),
            "note" => Ok(EntityKind::Note),
            "event" => Ok(EntityKind::Event),
            "project" => Ok(EntityKind::Project),
            "contact" => Ok(EntityKind::Contact),
            "meeting" => Ok(EntityKind::Meeting),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// Error returned when a string does not name a folder-contract kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity kind: {0}")]
pub struct UnknownKind(pub String);

/// Fallback listing bucket for entities whose kind has no folder contract.
///
/// Never used for writes; only for listing and path resolution of foreign
/// files.
pub const FALLBACK_FOLDER: &str = "processed";

/// Kind prefixes accepted by ID validation beyond the folder-contract set.
///
/// These mirror the original registry; entities of these kinds can be
/// referenced by links but cannot be created through the Host API.
pub const EXTENDED_KINDS: [&str; 4] = ["resource", "template", "reference", "idea"];

//─────────────────────────────
//  Canonical event names
//─────────────────────────────

/// Event names emitted by the core. Adapters and plugins may publish under
/// namespaces they own; unknown names are accepted but flagged in
/// diagnostics.
pub mod events {
    /// A new entity was written to the vault.
    pub const ENTITY_CREATED: &str = "entity.created";
    /// An existing entity was mutated.
    pub const ENTITY_UPDATED: &str = "entity.updated";
    /// An entity was removed from the vault.
    pub const ENTITY_DELETED: &str = "entity.deleted";
    /// A plugin process was launched and activated.
    pub const PLUGIN_ACTIVATED: &str = "plugin.activated";
    /// A plugin exceeded its restart budget and was disabled.
    pub const PLUGIN_FAILED: &str = "plugin.failed";
    /// An ingress payload passed normalization.
    pub const INBOX_NORMALIZED: &str = "inbox.normalized";

    /// Names the core knows about; anything else is adapter/plugin-owned.
    pub const CORE_EVENTS: [&str; 14] = [
        ENTITY_CREATED,
        ENTITY_UPDATED,
        ENTITY_DELETED,
        "task.created",
        "task.due_soon",
        "task.enter_doing",
        "task.enter_review",
        "task.enter_done",
        "task.enter_blocked",
        "event.received",
        "meeting.finished",
        INBOX_NORMALIZED,
        PLUGIN_ACTIVATED,
        PLUGIN_FAILED,
    ];

    /// Whether `name` is one of the canonical core event names.
    pub fn is_core_event(name: &str) -> bool {
        CORE_EVENTS.contains(&name)
    }
}

//─────────────────────────────
//  Process exit codes
//─────────────────────────────

/// Exit codes used by CLI collaborators that invoke the core.
pub mod exit_codes {
    /// Operation succeeded.
    pub const SUCCESS: i32 = 0;
    /// Generic error.
    pub const ERROR: i32 = 1;
    /// Entity failed validation.
    pub const VALIDATION: i32 = 2;
    /// Filesystem or storage failure.
    pub const IO: i32 = 5;
    /// Missing or invalid configuration.
    pub const CONFIG: i32 = 6;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!("widget".parse::<EntityKind>().is_err());
        assert!("".parse::<EntityKind>().is_err());
    }

    #[test]
    fn folder_mapping_is_fixed() {
        assert_eq!(EntityKind::Task.folder(), "tasks");
        assert_eq!(EntityKind::Meeting.folder(), "meetings");
        assert_eq!(FALLBACK_FOLDER, "processed");
    }

    #[test]
    fn core_event_names_are_dotted() {
        for name in events::CORE_EVENTS {
            assert!(name.contains('.'), "event name must be dot-separated: {name}");
        }
        assert!(events::is_core_event("entity.created"));
        assert!(!events::is_core_event("sync.tick"));
    }

    #[test]
    fn kind_serde_uses_lowercase() {
        let json = serde_json::to_string(&EntityKind::Task).unwrap();
        assert_eq!(json, "\"task\"");
        let kind: EntityKind = serde_json::from_str("\"meeting\"").unwrap();
        assert_eq!(kind, EntityKind::Meeting);
    }
}
