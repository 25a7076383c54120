//! The in-memory entity model.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;

use kira_md::MarkdownDocument;
use kira_types::{EntityKind, Metadata};

use crate::HostError;

/// A vault entity: typed Markdown file with front-matter metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Entity identifier (`<kind>-YYYYMMDD-HHmm-<slug>`).
    pub id: String,
    /// Kind derived from the ID prefix.
    pub kind: EntityKind,
    /// Front-matter metadata.
    pub metadata: Metadata,
    /// Markdown body.
    pub content: String,
    /// On-disk location, once written.
    pub path: Option<PathBuf>,
    /// Creation instant (from the `created` field).
    pub created_at: DateTime<Utc>,
    /// Last mutation instant (from the `updated` field).
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Build an entity from a parsed Markdown document.
    pub fn from_markdown(
        entity_id: &str,
        document: MarkdownDocument,
        file_path: Option<&Path>,
    ) -> Result<Self, HostError> {
        let parsed = kira_ids::parse_entity_id(entity_id)?;
        let kind = parsed
            .typed_kind()
            .ok_or_else(|| HostError::InvalidId(kira_ids::IdError::InvalidKind(parsed.kind.clone())))?;

        let now = kira_time::now_utc();
        let created_at = document
            .get_metadata_str("created")
            .and_then(|s| kira_time::parse_utc_iso8601(s).ok())
            .unwrap_or(now);
        let updated_at = document
            .get_metadata_str("updated")
            .and_then(|s| kira_time::parse_utc_iso8601(s).ok())
            .unwrap_or(now);

        Ok(Self {
            id: entity_id.to_string(),
            kind,
            metadata: document.frontmatter,
            content: document.content,
            path: file_path.map(Path::to_path_buf),
            created_at,
            updated_at,
        })
    }

    /// Render as a Markdown document, forcing the identity and timestamp
    /// fields into the front-matter.
    pub fn to_markdown(&self) -> MarkdownDocument {
        let mut frontmatter = self.metadata.clone();
        frontmatter.insert("id".into(), Value::String(self.id.clone()));
        frontmatter.insert(
            "created".into(),
            Value::String(kira_time::format_utc_iso8601(self.created_at)),
        );
        frontmatter.insert(
            "updated".into(),
            Value::String(kira_time::format_utc_iso8601(self.updated_at)),
        );
        MarkdownDocument::new(frontmatter, self.content.clone())
    }

    /// Title from metadata, falling back to the first content line.
    pub fn title(&self) -> String {
        if let Some(title) = self.metadata.get("title").and_then(Value::as_str) {
            if !title.is_empty() {
                return title.to_string();
            }
        }
        if let Some(first_line) = self.content.lines().next() {
            let trimmed = first_line.trim_start_matches('#').trim();
            if !trimmed.is_empty() {
                return trimmed.chars().take(50).collect();
            }
        }
        self.id.clone()
    }
}
