//! Reads notes written by older installations.
//!
//! Two layouts predate the index + content file design, both under a user's
//! `notes/` directory:
//!
//! * split: `<id>/meta.json` next to `<id>/content.md`
//! * combined: `<id>.json` holding the metadata and an inline `content` field
//!
//! Each layout is a [`LegacyStrategy`]: it names the documents it needs and
//! decodes their raw bytes into a current [`Note`]. The [`LegacyReader`] tries
//! the strategies in order and never writes anything back.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use serde::Deserialize;

use crate::{read_optional, Note, NoteMeta, NotesError, Result, DEFAULT_TITLE};

pub trait LegacyStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Documents making up one note, relative to the notes directory. The
    /// first one must exist for the shape to be considered present.
    fn documents(&self, note_id: &str) -> Vec<PathBuf>;

    /// Recognizes a directory entry of the notes directory as a note in
    /// this shape and returns its id.
    fn detect(&self, entry_name: &str, is_dir: bool) -> Option<String>;

    /// Decodes the documents, in [`documents`](Self::documents) order, into
    /// a normalized note. `Ok(None)` means the shape is not present.
    fn decode(
        &self,
        note_id: &str,
        documents: &[Option<Vec<u8>>],
    ) -> serde_json::Result<Option<Note>>;
}

/// `<id>/meta.json` + `<id>/content.md`.
pub struct SplitShape;

impl LegacyStrategy for SplitShape {
    fn name(&self) -> &'static str {
        "split"
    }

    fn documents(&self, note_id: &str) -> Vec<PathBuf> {
        vec![
            Path::new(note_id).join("meta.json"),
            Path::new(note_id).join("content.md"),
        ]
    }

    fn detect(&self, entry_name: &str, is_dir: bool) -> Option<String> {
        is_dir.then(|| entry_name.to_string())
    }

    fn decode(
        &self,
        note_id: &str,
        documents: &[Option<Vec<u8>>],
    ) -> serde_json::Result<Option<Note>> {
        let Some(Some(meta_bytes)) = documents.first() else {
            return Ok(None);
        };
        let meta: LegacyMeta = serde_json::from_slice(meta_bytes)?;
        let content = documents
            .get(1)
            .and_then(|doc| doc.as_deref())
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();
        Ok(Some(meta.into_note(note_id, content)))
    }
}

/// `<id>.json` with an inline `content` field.
pub struct CombinedShape;

impl LegacyStrategy for CombinedShape {
    fn name(&self) -> &'static str {
        "combined"
    }

    fn documents(&self, note_id: &str) -> Vec<PathBuf> {
        vec![PathBuf::from(format!("{}.json", note_id))]
    }

    fn detect(&self, entry_name: &str, is_dir: bool) -> Option<String> {
        if is_dir {
            return None;
        }
        entry_name.strip_suffix(".json").map(str::to_string)
    }

    fn decode(
        &self,
        note_id: &str,
        documents: &[Option<Vec<u8>>],
    ) -> serde_json::Result<Option<Note>> {
        let Some(Some(bytes)) = documents.first() else {
            return Ok(None);
        };
        let mut meta: LegacyMeta = serde_json::from_slice(bytes)?;
        let content = meta.content.take().unwrap_or_default();
        Ok(Some(meta.into_note(note_id, content)))
    }
}

/// Lenient view of a legacy metadata document: every field optional, either
/// key casing, tags as a list or a comma-separated string.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LegacyMeta {
    title: Option<String>,
    #[serde(alias = "tag")]
    tags: StringSet,
    #[serde(alias = "group")]
    groups: StringSet,
    #[serde(alias = "password_protected", alias = "protected")]
    password_protected: bool,
    #[serde(alias = "password_hash")]
    password_hash: Option<String>,
    #[serde(alias = "share_id")]
    share_id: Option<String>,
    #[serde(alias = "created_at")]
    created_at: Option<DateTime<Utc>>,
    #[serde(alias = "updated_at")]
    updated_at: Option<DateTime<Utc>>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringSet {
    List(Vec<String>),
    Csv(String),
}

impl Default for StringSet {
    fn default() -> Self {
        StringSet::List(Vec::new())
    }
}

impl StringSet {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringSet::List(values) => values,
            StringSet::Csv(joined) => joined.split(',').map(str::to_string).collect(),
        }
    }
}

impl LegacyMeta {
    fn into_note(self, note_id: &str, content: String) -> Note {
        let updated_at = self
            .updated_at
            .or(self.created_at)
            .unwrap_or_default();
        let created_at = self.created_at.unwrap_or(updated_at);

        let mut meta = NoteMeta {
            id: note_id.to_string(),
            title: self.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            tags: self.tags.into_vec(),
            groups: self.groups.into_vec(),
            password_protected: self.password_protected,
            password_hash: self.password_hash,
            share_id: self.share_id.filter(|s| !s.is_empty()),
            created_at,
            updated_at,
        };
        meta.normalize();
        Note::from_parts(meta, content)
    }
}

/// Tries each legacy strategy in order.
pub struct LegacyReader {
    strategies: Vec<Box<dyn LegacyStrategy>>,
}

impl Default for LegacyReader {
    fn default() -> Self {
        Self::with_strategies(vec![Box::new(SplitShape), Box::new(CombinedShape)])
    }
}

impl LegacyReader {
    pub fn with_strategies(strategies: Vec<Box<dyn LegacyStrategy>>) -> Self {
        Self { strategies }
    }

    /// Reads `note_id` from the first legacy shape present under
    /// `notes_dir`. Malformed documents are logged and skipped.
    pub async fn read(&self, notes_dir: &Path, user_id: &str, note_id: &str) -> Result<Note> {
        for strategy in &self.strategies {
            let paths: Vec<PathBuf> = strategy
                .documents(note_id)
                .into_iter()
                .map(|p| notes_dir.join(p))
                .collect();

            let Some(first) = read_optional(&paths[0]).await? else {
                continue;
            };
            let mut documents = vec![Some(first)];
            for path in &paths[1..] {
                documents.push(read_optional(path).await?);
            }

            match strategy.decode(note_id, &documents) {
                Ok(Some(note)) => {
                    debug!(
                        "Read {}/{} from legacy {} shape",
                        user_id,
                        note_id,
                        strategy.name()
                    );
                    return Ok(note);
                }
                Ok(None) => {}
                Err(e) => {
                    let err = NotesError::Malformed {
                        path: paths[0].clone(),
                        message: e.to_string(),
                    };
                    warn!("Skipping legacy {} document: {}", strategy.name(), err);
                }
            }
        }

        trace!("No legacy shape for {}/{}", user_id, note_id);
        Err(NotesError::note_not_found(user_id, note_id))
    }

    /// Ids that have a document in at least one legacy shape.
    pub async fn scan(&self, notes_dir: &Path) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(notes_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(NotesError::Io(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await?.is_dir();
            for strategy in &self.strategies {
                let Some(id) = strategy.detect(&name, is_dir) else {
                    continue;
                };
                let primary = notes_dir.join(&strategy.documents(&id)[0]);
                if crate::validate_id(&id).is_ok() && tokio::fs::try_exists(&primary).await? {
                    ids.push(id);
                    break;
                }
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Every path any strategy could use for `note_id`, for cleanup.
    pub fn document_paths(&self, notes_dir: &Path, note_id: &str) -> Vec<PathBuf> {
        self.strategies
            .iter()
            .flat_map(|s| s.documents(note_id))
            .map(|p| notes_dir.join(p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const META: &str = r#"{
        "title": "Groceries",
        "tags": ["home"],
        "groups": "errands, weekly",
        "createdAt": "2021-03-04T05:06:07Z",
        "updatedAt": "2021-03-05T05:06:07Z"
    }"#;

    #[test]
    fn split_decode_is_pure() {
        let note = SplitShape
            .decode(
                "abc",
                &[Some(META.as_bytes().to_vec()), Some(b"- milk".to_vec())],
            )
            .unwrap()
            .unwrap();
        assert_eq!(note.meta.title, "Groceries");
        assert_eq!(note.meta.groups, vec!["errands", "weekly"]);
        assert_eq!(note.content, "- milk");

        let missing = SplitShape.decode("abc", &[None, None]).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn combined_moves_content_out_of_metadata() {
        let doc = r#"{"title":"T","content":"body","tags":"a,b","created_at":"2020-01-01T00:00:00Z"}"#;
        let note = CombinedShape
            .decode("xyz", &[Some(doc.as_bytes().to_vec())])
            .unwrap()
            .unwrap();
        assert_eq!(note.content, "body");
        assert_eq!(note.meta.tags, vec!["a", "b"]);
        assert_eq!(note.meta.created_at, note.meta.updated_at);
        assert_eq!(note.meta.id, "xyz");
    }

    #[test]
    fn unprotected_legacy_hash_is_dropped() {
        let doc = r#"{"passwordHash":"h","passwordProtected":false}"#;
        let note = CombinedShape
            .decode("x", &[Some(doc.as_bytes().to_vec())])
            .unwrap()
            .unwrap();
        assert_eq!(note.meta.password_hash, None);
        assert_eq!(note.meta.title, DEFAULT_TITLE);
        assert_eq!(note.meta.created_at, DateTime::<Utc>::default());
    }

    #[tokio::test]
    async fn reader_prefers_split_then_combined() {
        let dir = TempDir::new().unwrap();
        let notes = dir.path();
        fs::create_dir_all(notes.join("n1")).unwrap();
        fs::write(notes.join("n1/meta.json"), META).unwrap();
        fs::write(notes.join("n1.json"), r#"{"title":"older","content":"x"}"#).unwrap();
        fs::write(notes.join("n2.json"), r#"{"title":"only combined","content":"y"}"#).unwrap();

        let reader = LegacyReader::default();
        let n1 = reader.read(notes, "alice", "n1").await.unwrap();
        assert_eq!(n1.meta.title, "Groceries");
        assert_eq!(n1.content, "");

        let n2 = reader.read(notes, "alice", "n2").await.unwrap();
        assert_eq!(n2.content, "y");

        assert!(reader.read(notes, "alice", "n3").await.unwrap_err().is_not_found());
        assert_eq!(reader.scan(notes).await.unwrap(), vec!["n1", "n2"]);
    }

    #[tokio::test]
    async fn malformed_split_falls_through_to_combined() {
        let dir = TempDir::new().unwrap();
        let notes = dir.path();
        fs::create_dir_all(notes.join("n1")).unwrap();
        fs::write(notes.join("n1/meta.json"), "{ broken").unwrap();
        fs::write(notes.join("n1.json"), r#"{"title":"fallback"}"#).unwrap();

        let note = LegacyReader::default().read(notes, "alice", "n1").await.unwrap();
        assert_eq!(note.meta.title, "fallback");
    }
}
