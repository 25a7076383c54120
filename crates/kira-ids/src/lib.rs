#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-ids** – Stable entity identifiers and collision prevention.
//!
//! Every vault entity is keyed by `<kind>-YYYYMMDD-HHmm-<slug>`, e.g.
//! `task-20250115-1430-fix-auth-bug`. The timestamp portion is rendered in
//! the configured local zone (that is what a human reads in the filename);
//! the slug is a lowercase alnum-hyphen normalisation of the title capped at
//! 50 chars. IDs are unique within a vault; the [`CollisionDetector`]
//! resolves clashes with numeric suffixes.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use kira_types::{EXTENDED_KINDS, EntityKind, MAX_ENTITY_ID_LEN, MAX_SLUG_LEN};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced by ID parsing and generation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The string does not split into `<kind>-<unique>`.
    #[error("invalid entity ID format: {0}")]
    InvalidFormat(String),
    /// The kind prefix is not a registered entity kind.
    #[error("invalid entity kind in ID: {0}")]
    InvalidKind(String),
    /// The unique part after the kind prefix is empty.
    #[error("empty unique part in ID: {0}")]
    EmptyUniquePart(String),
}

//─────────────────────────────
//  Structured entity ID
//─────────────────────────────

/// Parsed entity identifier: kind prefix plus unique part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId {
    /// Kind prefix (`task`, `note`, …).
    pub kind: String,
    /// Remainder after the first hyphen.
    pub unique_part: String,
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.unique_part)
    }
}

impl EntityId {
    /// Kind as the typed enum when it carries a folder contract.
    pub fn typed_kind(&self) -> Option<EntityKind> {
        self.kind.parse().ok()
    }
}

static KIND_FORMAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9]{1,19}$").unwrap());
static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());
static NUMERIC_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)-(\d+)$").unwrap());

fn is_registered_kind(kind: &str) -> bool {
    if !KIND_FORMAT.is_match(kind) {
        return false;
    }
    kind.parse::<EntityKind>().is_ok() || EXTENDED_KINDS.contains(&kind)
}

/// Parse an entity ID into its components.
pub fn parse_entity_id(entity_id: &str) -> Result<EntityId, IdError> {
    let (kind, unique_part) = entity_id
        .split_once('-')
        .ok_or_else(|| IdError::InvalidFormat(entity_id.to_string()))?;

    if !is_registered_kind(kind) {
        return Err(IdError::InvalidKind(kind.to_string()));
    }
    if unique_part.is_empty() {
        return Err(IdError::EmptyUniquePart(entity_id.to_string()));
    }

    Ok(EntityId {
        kind: kind.to_string(),
        unique_part: unique_part.to_string(),
    })
}

/// Whether a string is a well-formed entity ID.
pub fn is_valid_entity_id(entity_id: &str) -> bool {
    parse_entity_id(entity_id).is_ok()
}

//─────────────────────────────
//  Slugs and generation
//─────────────────────────────

/// Lowercase `text`, collapse runs of non-alphanumerics into single hyphens
/// and trim them from both ends.
pub fn slugify(text: &str) -> String {
    let lower = text.to_lowercase();
    let slug = NON_ALNUM.replace_all(&lower, "-");
    slug.trim_matches('-').to_string()
}

/// Short random hex identifier used when a title yields no slug.
pub fn short_random_id(length: usize) -> String {
    Uuid::new_v4().simple().to_string()[..length].to_string()
}

/// Generate an entity ID from kind, title and timestamp.
///
/// The timestamp renders as `YYYYMMDD-HHmm` in `tz`; the slug comes from the
/// title (capped at 50 chars) or falls back to an 8-char random suffix. The
/// full ID is capped at 100 chars by truncating the slug.
pub fn generate_entity_id(
    kind: EntityKind,
    title: &str,
    timestamp: DateTime<Utc>,
    tz: Tz,
) -> String {
    let stamp = kira_time::format_datetime_for_id(timestamp, tz);

    let mut slug = slugify(title);
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_matches('-').to_string();
    let slug = if slug.is_empty() { short_random_id(8) } else { slug };

    let mut id = format!("{}-{}-{}", kind, stamp, slug);
    if id.len() > MAX_ENTITY_ID_LEN {
        let prefix_len = format!("{}-{}-", kind, stamp).len();
        let max_slug = MAX_ENTITY_ID_LEN - prefix_len;
        id = format!("{}-{}-{}", kind, stamp, &slug[..max_slug]);
    }
    id
}

/// Sanitize an arbitrary string for safe use as a filename fragment.
pub fn sanitize_filename(name: &str) -> String {
    static UNSAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[<>:"/\\|?*]"#).unwrap());
    static CONTROL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\x00-\x1f\x7f]").unwrap());
    static HYPHENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"-+").unwrap());

    let safe = UNSAFE.replace_all(name, "-");
    let safe = CONTROL.replace_all(&safe, "");
    let safe = HYPHENS.replace_all(&safe, "-");
    let mut safe = safe.trim_matches('-').to_string();

    if safe.is_empty() {
        safe = "unnamed".to_string();
    }
    safe.truncate(200);
    safe
}

//─────────────────────────────
//  Collision detection
//─────────────────────────────

/// Tracks IDs already present in a vault and resolves clashes by appending
/// `-2`, `-3`, … (falling back to a random suffix after 100 attempts).
#[derive(Debug, Default)]
pub struct CollisionDetector {
    used: HashSet<String>,
    base_counts: HashMap<String, u32>,
}

impl CollisionDetector {
    /// Empty detector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ID as taken.
    pub fn register_id(&mut self, entity_id: &str) {
        self.used.insert(entity_id.to_string());
        let base = Self::base_id(entity_id);
        *self.base_counts.entry(base).or_insert(0) += 1;
    }

    /// Whether an ID is already taken.
    pub fn is_collision(&self, entity_id: &str) -> bool {
        self.used.contains(entity_id)
    }

    /// Generate a unique ID, suffixing on collision. The returned ID is not
    /// auto-registered; callers register after the write succeeds.
    pub fn generate_unique_id(
        &self,
        kind: EntityKind,
        title: &str,
        timestamp: DateTime<Utc>,
        tz: Tz,
    ) -> String {
        let base = generate_entity_id(kind, title, timestamp, tz);
        if !self.is_collision(&base) {
            return base;
        }

        for attempt in 2..=100u32 {
            let candidate = format!("{base}-{attempt}");
            if !self.is_collision(&candidate) {
                return candidate;
            }
        }

        format!("{base}-{}", short_random_id(8))
    }

    /// Number of registered IDs sharing `base_id` (numeric suffixes folded).
    pub fn collision_count(&self, base_id: &str) -> u32 {
        self.base_counts.get(base_id).copied().unwrap_or(0)
    }

    fn base_id(entity_id: &str) -> String {
        match NUMERIC_SUFFIX.captures(entity_id) {
            Some(caps) => caps[1].to_string(),
            None => entity_id.to_string(),
        }
    }
}
