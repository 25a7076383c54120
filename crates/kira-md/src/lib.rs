#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-md** – Markdown entity files with YAML front-matter.
//!
//! A vault entity on disk is `---\n<frontmatter>\n---\n\n<body>`. This crate
//! owns reading and writing those files: deterministic front-matter
//! serialization (see [`serializer`]) and atomic writes (temp file, fsync,
//! rename, directory fsync) so a crash never leaves a half-written entity.
//!
//! Nothing here knows about entity kinds or validation; higher layers
//! compose those concerns.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use kira_types::Metadata;

pub mod serializer;
pub use serializer::{
    canonical_key_order, normalize_timestamps_to_utc, parse_frontmatter, serialize_frontmatter,
    CANONICAL_KEY_ORDER,
};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced by Markdown I/O.
#[derive(Debug, thiserror::Error)]
pub enum MdError {
    /// File does not exist.
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    /// The front-matter block is not valid YAML or not a mapping.
    #[error("invalid frontmatter: {0}")]
    InvalidFrontmatter(String),
    /// Underlying filesystem failure.
    #[error("markdown I/O failed for {path}: {source}")]
    Io {
        /// File the operation targeted.
        path: PathBuf,
        /// OS-level error.
        #[source]
        source: std::io::Error,
    },
}

//─────────────────────────────
//  Document model
//─────────────────────────────

/// In-memory Markdown document: front-matter mapping plus body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkdownDocument {
    /// YAML front-matter metadata.
    pub frontmatter: Metadata,
    /// Markdown content body.
    pub content: String,
}

impl MarkdownDocument {
    /// Document with the given front-matter and body.
    pub fn new(frontmatter: Metadata, content: impl Into<String>) -> Self {
        Self { frontmatter, content: content.into() }
    }

    /// Front-matter value for `key`.
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.frontmatter.get(key)
    }

    /// Front-matter string value for `key`.
    pub fn get_metadata_str(&self, key: &str) -> Option<&str> {
        self.frontmatter.get(key).and_then(Value::as_str)
    }

    /// Insert or replace a front-matter value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.frontmatter.insert(key.into(), value);
    }

    /// Whether the front-matter carries `key`.
    pub fn has_metadata(&self, key: &str) -> bool {
        self.frontmatter.contains_key(key)
    }

    /// Render the full document in canonical form.
    ///
    /// Without front-matter the body is returned as-is. With front-matter
    /// the delimiters carry no trailing whitespace and the body is separated
    /// by exactly one blank line.
    pub fn to_markdown_string(&self) -> String {
        if self.frontmatter.is_empty() {
            return self.content.clone();
        }

        let yaml = serialize_frontmatter(&self.frontmatter);
        let mut parts = vec!["---".to_string(), yaml, "---".to_string()];
        if !self.content.trim().is_empty() {
            parts.push(String::new());
            parts.push(self.content.clone());
        }
        parts.join("\n")
    }
}

//─────────────────────────────
//  Parsing
//─────────────────────────────

/// Parse raw Markdown with optional front-matter.
///
/// A document without a leading `---` is all content. A leading `---` with
/// no closing delimiter degrades to all content; a delimited block that is
/// not valid YAML is an error.
pub fn parse_markdown(raw: &str) -> Result<MarkdownDocument, MdError> {
    if raw.trim().is_empty() {
        return Ok(MarkdownDocument::default());
    }
    if !raw.starts_with("---") {
        return Ok(MarkdownDocument::new(Metadata::new(), raw));
    }

    // The delimiters are whole lines; a `---` inside a value is not one.
    let lines: Vec<&str> = raw.split('\n').collect();
    if lines[0].trim_end() != "---" {
        return Ok(MarkdownDocument::new(Metadata::new(), raw));
    }
    let close = lines[1..].iter().position(|line| line.trim_end() == "---");
    let close = match close {
        Some(offset) => offset + 1,
        // No closing delimiter.
        None => return Ok(MarkdownDocument::new(Metadata::new(), raw)),
    };

    let frontmatter_raw = lines[1..close].join("\n");
    let body = lines[close + 1..].join("\n");
    let body = body.trim_start_matches('\n');

    let frontmatter = if frontmatter_raw.trim().is_empty() {
        Metadata::new()
    } else {
        parse_frontmatter(&frontmatter_raw)?
    };

    Ok(MarkdownDocument::new(frontmatter, body))
}

/// Read and parse a Markdown file.
pub fn read_markdown(path: impl AsRef<Path>) -> Result<MarkdownDocument, MdError> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            MdError::NotFound(path.to_path_buf())
        } else {
            MdError::Io { path: path.to_path_buf(), source }
        }
    })?;
    parse_markdown(&raw)
}

//─────────────────────────────
//  Atomic writes
//─────────────────────────────

fn io_err(path: &Path, source: std::io::Error) -> MdError {
    MdError::Io { path: path.to_path_buf(), source }
}

/// Write a document atomically: temp file on the same filesystem, fsync,
/// rename over the target, fsync the directory. A crash at any point leaves
/// either the old file or the new file, never a torn one.
pub fn write_markdown(path: impl AsRef<Path>, document: &MarkdownDocument) -> Result<(), MdError> {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_err(path, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "entity".to_string());
    let tmp_path = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));

    let content = document.to_markdown_string();
    {
        let mut tmp = fs::File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
        tmp.write_all(content.as_bytes()).map_err(|e| io_err(&tmp_path, e))?;
        tmp.sync_all().map_err(|e| io_err(&tmp_path, e))?;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_err(path, e));
    }

    // Persist the rename itself.
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Apply front-matter updates to an existing file and write it back.
pub fn update_frontmatter(
    path: impl AsRef<Path>,
    updates: Metadata,
    create_if_missing: bool,
) -> Result<MarkdownDocument, MdError> {
    let path = path.as_ref();
    let mut document = if path.exists() {
        read_markdown(path)?
    } else if create_if_missing {
        MarkdownDocument::default()
    } else {
        return Err(MdError::NotFound(path.to_path_buf()));
    };

    for (key, value) in updates {
        document.frontmatter.insert(key, value);
    }

    write_markdown(path, &document)?;
    Ok(document)
}

//─────────────────────────────
//  Helpers
//─────────────────────────────

static H1: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#\s+(.+)$").unwrap());

/// Title from front-matter, falling back to the first H1 heading.
pub fn extract_title(document: &MarkdownDocument) -> Option<String> {
    if let Some(title) = document.get_metadata_str("title") {
        let trimmed = title.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    H1.captures(&document.content)
        .map(|caps| caps[1].trim().to_string())
}

/// Required fields missing from front-matter (absent, null, or empty
/// string).
pub fn missing_required_fields(frontmatter: &Metadata, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|field| match frontmatter.get(**field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        })
        .map(|field| field.to_string())
        .collect()
}
