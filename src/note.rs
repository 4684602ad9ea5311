//! Core data structures for notes.
//!
//! A note is split in two on disk: [`NoteMeta`] lives in the per-user index,
//! the markdown body lives in its own content file.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TITLE: &str = "Untitled";

/// Metadata for one note, as stored in the per-user index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteMeta {
    /// Unique identifier for the note
    pub id: String,
    /// Note title
    pub title: String,
    /// Tags for organization
    #[serde(default)]
    pub tags: Vec<String>,
    /// Groups the note belongs to
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub password_protected: bool,
    /// Opaque hash; only present when `password_protected` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Token of the active share link, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    /// When the note was created
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl NoteMeta {
    pub fn new(id: String, title: String) -> Self {
        let now = Utc::now();
        NoteMeta {
            id,
            title,
            tags: Vec::new(),
            groups: Vec::new(),
            password_protected: false,
            password_hash: None,
            share_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enforces the stored-form invariants: tag and group sets are trimmed,
    /// deduplicated and sorted, a blank title becomes "Untitled", and an
    /// unprotected note carries no password hash.
    pub fn normalize(&mut self) {
        if self.title.trim().is_empty() {
            self.title = DEFAULT_TITLE.to_string();
        }
        normalize_set(&mut self.tags);
        normalize_set(&mut self.groups);
        if !self.password_protected {
            self.password_hash = None;
        }
    }
}

/// A full note: index metadata plus markdown content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(flatten)]
    pub meta: NoteMeta,
    /// Note content in Markdown format
    #[serde(default)]
    pub content: String,
}

impl Note {
    /// Creates an empty note with a fresh identifier and both timestamps at now.
    pub fn new(title: &str) -> Self {
        let title = if title.trim().is_empty() {
            DEFAULT_TITLE.to_string()
        } else {
            title.to_string()
        };
        Note {
            meta: NoteMeta::new(crate::new_note_id(), title),
            content: String::new(),
        }
    }

    pub fn from_parts(meta: NoteMeta, content: String) -> Self {
        Note { meta, content }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }
}

/// Field-level update applied on top of the stored note. `None` keeps the
/// stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotePatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub groups: Option<Vec<String>>,
    pub protection: Option<Protection>,
    /// `Some(None)` clears the share id, `Some(Some(token))` sets it.
    pub share_id: Option<Option<String>>,
}

/// Password protection change carried by a [`NotePatch`]. The store only
/// ever sees hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protection {
    Enabled { password_hash: String },
    Disabled,
}

impl NotePatch {
    pub fn apply(self, note: &mut Note) {
        if let Some(title) = self.title {
            note.meta.title = title;
        }
        if let Some(content) = self.content {
            note.content = content;
        }
        if let Some(tags) = self.tags {
            note.meta.tags = tags;
        }
        if let Some(groups) = self.groups {
            note.meta.groups = groups;
        }
        match self.protection {
            Some(Protection::Enabled { password_hash }) => {
                note.meta.password_protected = true;
                note.meta.password_hash = Some(password_hash);
            }
            Some(Protection::Disabled) => {
                note.meta.password_protected = false;
                note.meta.password_hash = None;
            }
            None => {}
        }
        if let Some(share_id) = self.share_id {
            note.meta.share_id = share_id;
        }
    }
}

/// How a store write combines with what is already on disk.
#[derive(Debug, Clone)]
pub enum WriteMode {
    /// Replace the metadata wholesale. The caller must carry forward
    /// `created_at`, `share_id` and `password_hash` itself.
    Replace(Note),
    /// Apply only the named fields on top of the stored note.
    Patch(NotePatch),
}

fn normalize_set(values: &mut Vec<String>) {
    let mut cleaned: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    cleaned.sort();
    cleaned.dedup();
    *values = cleaned;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_hash_of_unprotected_note() {
        let mut meta = NoteMeta::new("abc".to_string(), "  ".to_string());
        meta.password_hash = Some("stale".to_string());
        meta.tags = vec!["work".into(), " home ".into(), "work".into(), "".into()];
        meta.normalize();

        assert_eq!(meta.title, DEFAULT_TITLE);
        assert_eq!(meta.password_hash, None);
        assert_eq!(meta.tags, vec!["home".to_string(), "work".to_string()]);
    }

    #[test]
    fn patch_preserves_unnamed_fields() {
        let mut note = Note::new("Groceries");
        note.meta.share_id = Some("tok".to_string());
        note.meta.password_protected = true;
        note.meta.password_hash = Some("hash".to_string());
        let created = note.meta.created_at;

        NotePatch {
            content: Some("- milk".to_string()),
            ..Default::default()
        }
        .apply(&mut note);

        assert_eq!(note.content, "- milk");
        assert_eq!(note.meta.title, "Groceries");
        assert_eq!(note.meta.share_id.as_deref(), Some("tok"));
        assert_eq!(note.meta.password_hash.as_deref(), Some("hash"));
        assert_eq!(note.meta.created_at, created);
    }

    #[test]
    fn patch_can_clear_share_and_protection() {
        let mut note = Note::new("Secret");
        note.meta.share_id = Some("tok".to_string());
        note.meta.password_protected = true;
        note.meta.password_hash = Some("hash".to_string());

        NotePatch {
            protection: Some(Protection::Disabled),
            share_id: Some(None),
            ..Default::default()
        }
        .apply(&mut note);

        assert!(!note.meta.password_protected);
        assert_eq!(note.meta.password_hash, None);
        assert_eq!(note.meta.share_id, None);
    }

    #[test]
    fn index_entries_use_camel_case_and_omit_empty_options() {
        let meta = NoteMeta::new("abc".to_string(), "T".to_string());
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("passwordProtected").is_some());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("passwordHash").is_none());
        assert!(json.get("shareId").is_none());
    }
}
