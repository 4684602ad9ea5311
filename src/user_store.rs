//! Per-user flat-file note store.
//!
//! Layout under `<users_dir>/<user>/`:
//!
//! ```text
//! index.json          note id -> NoteMeta
//! notes/<id>.md       markdown content
//! media/<id>/<file>   uploaded files
//! ```
//!
//! Content is always written before the index entry that points at it, so a
//! reader never sees metadata for content that is not on disk yet. Index
//! read-modify-write cycles for one user are serialized by a per-user lock;
//! different users never contend.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    ensure_dir, list_files, read_json_optional, read_optional, remove_dir_if_exists,
    remove_file_if_exists, validate_id, validate_user_id, write_atomic, write_json_atomic,
    LegacyReader, Note, NoteMeta, NotePatch, NotesError, Result, SystemRegistry, UserSnapshot,
    WriteMode, DEFAULT_TITLE,
};

pub type NoteIndex = BTreeMap<String, NoteMeta>;

/// Reference to a stored media file, enough to build a retrieval URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub user_id: String,
    pub note_id: String,
    pub file_name: String,
    pub url_path: String,
}

/// Counts from merging one user's backup snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub notes_added: usize,
    pub notes_skipped: usize,
    pub contents_written: usize,
}

pub struct UserStore {
    users_dir: PathBuf,
    registry: Arc<SystemRegistry>,
    legacy: LegacyReader,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    ensured: Mutex<HashSet<String>>,
}

impl UserStore {
    pub fn new(users_dir: impl Into<PathBuf>, registry: Arc<SystemRegistry>) -> Self {
        Self::with_legacy_reader(users_dir, registry, LegacyReader::default())
    }

    pub fn with_legacy_reader(
        users_dir: impl Into<PathBuf>,
        registry: Arc<SystemRegistry>,
        legacy: LegacyReader,
    ) -> Self {
        Self {
            users_dir: users_dir.into(),
            registry,
            legacy,
            locks: Mutex::new(HashMap::new()),
            ensured: Mutex::new(HashSet::new()),
        }
    }

    pub fn user_dir(&self, user_id: &str) -> PathBuf {
        self.users_dir.join(user_id)
    }

    fn index_path(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("index.json")
    }

    pub fn notes_dir(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("notes")
    }

    fn content_path(&self, user_id: &str, note_id: &str) -> PathBuf {
        self.notes_dir(user_id).join(format!("{}.md", note_id))
    }

    pub fn media_root(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("media")
    }

    fn media_dir(&self, user_id: &str, note_id: &str) -> PathBuf {
        self.media_root(user_id).join(note_id)
    }

    /// Get or create the lock guarding one user's index.
    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Makes sure the user's directories and index exist and that the user
    /// is in the system registry. Idempotent.
    pub async fn ensure(&self, user_id: &str) -> Result<()> {
        validate_user_id(user_id)?;
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        self.ensure_layout(user_id).await
    }

    /// Caller must hold the user lock.
    async fn ensure_layout(&self, user_id: &str) -> Result<()> {
        if self.ensured.lock().await.contains(user_id) {
            return Ok(());
        }

        ensure_dir(&self.notes_dir(user_id)).await?;
        ensure_dir(&self.media_root(user_id)).await?;

        let index_path = self.index_path(user_id);
        if !tokio::fs::try_exists(&index_path).await? {
            debug!("Creating empty index for {}", user_id);
            write_json_atomic(&index_path, &NoteIndex::new()).await?;
        }

        self.registry.register(user_id).await?;
        self.ensured.lock().await.insert(user_id.to_string());
        Ok(())
    }

    /// Index as seen by read paths: a missing or unparsable index is empty.
    async fn load_index_for_read(&self, user_id: &str) -> Result<NoteIndex> {
        match read_json_optional::<NoteIndex>(&self.index_path(user_id)).await {
            Ok(index) => Ok(index.unwrap_or_default()),
            Err(e @ NotesError::Malformed { .. }) => {
                error!("Index for {} is unreadable, treating as empty: {}", user_id, e);
                Ok(NoteIndex::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Index as seen by write paths. An unparsable index is an error so it is
    /// never overwritten with a partial view.
    pub async fn load_index(&self, user_id: &str) -> Result<NoteIndex> {
        validate_user_id(user_id)?;
        Ok(read_json_optional(&self.index_path(user_id))
            .await?
            .unwrap_or_default())
    }

    async fn save_index(&self, user_id: &str, index: &NoteIndex) -> Result<()> {
        trace!("Saving index for {} ({} notes)", user_id, index.len());
        write_json_atomic(&self.index_path(user_id), index).await
    }

    /// Content of a note, `None` if the content file does not exist.
    pub async fn read_content(&self, user_id: &str, note_id: &str) -> Result<Option<String>> {
        validate_user_id(user_id)?;
        validate_id(note_id)?;
        Ok(read_optional(&self.content_path(user_id, note_id))
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Reads a full note: the index entry plus its content, falling back to
    /// the legacy layouts when the index has no entry. Never creates anything.
    pub async fn read(&self, user_id: &str, note_id: &str) -> Result<Note> {
        if validate_user_id(user_id).is_err() || validate_id(note_id).is_err() {
            return Err(NotesError::note_not_found(user_id, note_id));
        }

        let index = self.load_index_for_read(user_id).await?;
        if let Some(meta) = index.get(note_id) {
            let content = self.read_content(user_id, note_id).await?.unwrap_or_else(|| {
                debug!("Content missing for {}/{}, using empty", user_id, note_id);
                String::new()
            });
            return Ok(Note::from_parts(meta.clone(), content));
        }

        self.legacy
            .read(&self.notes_dir(user_id), user_id, note_id)
            .await
    }

    /// Upserts a note. Content is persisted before the index entry.
    ///
    /// `WriteMode::Replace` stores the given note as-is (apart from the id and
    /// `updated_at`); `WriteMode::Patch` applies the patch on top of the
    /// stored note, a legacy note, or a fresh "Untitled" note, in that order.
    pub async fn write(&self, user_id: &str, note_id: &str, mode: WriteMode) -> Result<Note> {
        validate_user_id(user_id)?;
        validate_id(note_id)?;

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        self.write_locked(user_id, note_id, mode).await
    }

    /// Caller must hold the user lock.
    async fn write_locked(&self, user_id: &str, note_id: &str, mode: WriteMode) -> Result<Note> {
        self.ensure_layout(user_id).await?;

        let mut index = self.load_index(user_id).await?;
        let mut note = match mode {
            WriteMode::Replace(note) => note,
            WriteMode::Patch(patch) => {
                let mut base = match index.get(note_id) {
                    Some(meta) => {
                        let content = self.read_content(user_id, note_id).await?;
                        Note::from_parts(meta.clone(), content.unwrap_or_default())
                    }
                    None => self.legacy_or_fresh(user_id, note_id).await?,
                };
                patch.apply(&mut base);
                base
            }
        };

        note.meta.id = note_id.to_string();
        note.meta.updated_at = Utc::now();
        note.meta.normalize();

        write_atomic(
            &self.content_path(user_id, note_id),
            note.content.clone().into_bytes(),
        )
        .await?;
        index.insert(note_id.to_string(), note.meta.clone());
        self.save_index(user_id, &index).await?;

        info!("Saved note {}/{}", user_id, note_id);
        Ok(note)
    }

    async fn legacy_or_fresh(&self, user_id: &str, note_id: &str) -> Result<Note> {
        match self
            .legacy
            .read(&self.notes_dir(user_id), user_id, note_id)
            .await
        {
            Ok(note) => Ok(note),
            Err(e) if e.is_not_found() => {
                let mut note = Note::new(DEFAULT_TITLE);
                note.meta.id = note_id.to_string();
                Ok(note)
            }
            Err(e) => Err(e),
        }
    }

    /// The stored note, indexed or legacy. Caller must hold the user lock.
    async fn read_locked(&self, user_id: &str, note_id: &str) -> Result<Note> {
        let index = self.load_index(user_id).await?;
        match index.get(note_id) {
            Some(meta) => {
                let content = self.read_content(user_id, note_id).await?;
                Ok(Note::from_parts(meta.clone(), content.unwrap_or_default()))
            }
            None => {
                self.legacy
                    .read(&self.notes_dir(user_id), user_id, note_id)
                    .await
            }
        }
    }

    /// Attaches `token` as the note's share id if the note has none or still
    /// carries `replacing`. Otherwise the note keeps its current share id.
    /// Returns the share id the note ends up with.
    pub async fn claim_share_id(
        &self,
        user_id: &str,
        note_id: &str,
        token: &str,
        replacing: Option<&str>,
    ) -> Result<String> {
        validate_user_id(user_id)?;
        validate_id(note_id)?;

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let current = self.read_locked(user_id, note_id).await?;
        if let Some(existing) = current.meta.share_id {
            if Some(existing.as_str()) != replacing {
                debug!("{}/{} already shared as {}", user_id, note_id, existing);
                return Ok(existing);
            }
        }

        let patch = NotePatch {
            share_id: Some(Some(token.to_string())),
            ..Default::default()
        };
        self.write_locked(user_id, note_id, WriteMode::Patch(patch))
            .await?;
        Ok(token.to_string())
    }

    /// Clears the note's share id and returns the one it had.
    pub async fn release_share_id(&self, user_id: &str, note_id: &str) -> Result<Option<String>> {
        validate_user_id(user_id)?;
        validate_id(note_id)?;

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let current = self.read_locked(user_id, note_id).await?;
        let Some(token) = current.meta.share_id else {
            return Ok(None);
        };
        let patch = NotePatch {
            share_id: Some(None),
            ..Default::default()
        };
        self.write_locked(user_id, note_id, WriteMode::Patch(patch))
            .await?;
        Ok(Some(token))
    }

    /// Removes the index entry, content file, media directory and any legacy
    /// documents. Each removal is attempted even if another fails; missing
    /// pieces are not errors. Returns the share id the note carried.
    pub async fn delete(&self, user_id: &str, note_id: &str) -> Result<Option<String>> {
        validate_user_id(user_id)?;
        validate_id(note_id)?;

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let share_id = match self.read_locked(user_id, note_id).await {
            Ok(note) => note.meta.share_id,
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!("Cannot read {}/{} before deleting: {}", user_id, note_id, e);
                None
            }
        };

        let mut first_error: Option<NotesError> = None;
        let mut record = |result: Result<()>, what: &str| {
            if let Err(e) = result {
                warn!("Failed to remove {} of {}/{}: {}", what, user_id, note_id, e);
                first_error.get_or_insert(e);
            }
        };

        record(
            self.remove_index_entry(user_id, note_id).await,
            "index entry",
        );

        let content = remove_file_if_exists(&self.content_path(user_id, note_id)).await;
        record(content.map(|_| ()), "content");

        let media = remove_dir_if_exists(&self.media_dir(user_id, note_id)).await;
        record(media.map(|_| ()), "media");

        let notes_dir = self.notes_dir(user_id);
        for path in self.legacy.document_paths(&notes_dir, note_id) {
            record(
                remove_file_if_exists(&path).await.map(|_| ()),
                "legacy document",
            );
        }
        // Leftover split-shape directory; fails harmlessly if absent or not empty.
        let _ = tokio::fs::remove_dir(notes_dir.join(note_id)).await;

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Deleted note {}/{}", user_id, note_id);
                Ok(share_id)
            }
        }
    }

    /// Caller must hold the user lock.
    async fn remove_index_entry(&self, user_id: &str, note_id: &str) -> Result<()> {
        let mut index = self.load_index(user_id).await?;
        if index.remove(note_id).is_some() {
            self.save_index(user_id, &index).await?;
        }
        Ok(())
    }

    /// All indexed notes' metadata, most recently updated first.
    pub async fn list(&self, user_id: &str) -> Result<Vec<NoteMeta>> {
        if validate_user_id(user_id).is_err() {
            return Ok(Vec::new());
        }
        let index = self.load_index_for_read(user_id).await?;
        let mut notes: Vec<NoteMeta> = index.into_values().collect();
        notes.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(notes)
    }

    /// Notes that exist only in a legacy layout, normalized. Unreadable ones
    /// are skipped.
    pub async fn legacy_notes(&self, user_id: &str) -> Result<Vec<Note>> {
        validate_user_id(user_id)?;
        let notes_dir = self.notes_dir(user_id);
        let index = self.load_index_for_read(user_id).await?;

        let mut notes = Vec::new();
        for note_id in self.legacy.scan(&notes_dir).await? {
            if index.contains_key(&note_id) {
                continue;
            }
            match self.legacy.read(&notes_dir, user_id, &note_id).await {
                Ok(note) => notes.push(note),
                Err(e) => warn!("Skipping legacy note {}/{}: {}", user_id, note_id, e),
            }
        }
        Ok(notes)
    }

    /// Additively merges a backup snapshot: index entries and content files
    /// are only added where nothing exists locally. Share ids are dropped
    /// from added entries since share tokens are not part of a backup.
    pub async fn merge(&self, user_id: &str, snapshot: &UserSnapshot) -> Result<MergeOutcome> {
        validate_user_id(user_id)?;

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        self.ensure_layout(user_id).await?;

        let mut index = self.load_index(user_id).await?;
        let legacy_ids: HashSet<String> = self
            .legacy
            .scan(&self.notes_dir(user_id))
            .await?
            .into_iter()
            .collect();
        let mut outcome = MergeOutcome::default();

        for (note_id, content) in &snapshot.contents {
            if validate_id(note_id).is_err() {
                warn!("Skipping content with invalid id {:?} for {}", note_id, user_id);
                continue;
            }
            if !snapshot.index.contains_key(note_id) || legacy_ids.contains(note_id) {
                debug!("Skipping content without an entry for {}/{}", user_id, note_id);
                continue;
            }
            let path = self.content_path(user_id, note_id);
            if tokio::fs::try_exists(&path).await? {
                continue;
            }
            write_atomic(&path, content.clone().into_bytes()).await?;
            outcome.contents_written += 1;
        }

        for (note_id, meta) in &snapshot.index {
            if validate_id(note_id).is_err() {
                warn!("Skipping note with invalid id {:?} for {}", note_id, user_id);
                outcome.notes_skipped += 1;
                continue;
            }
            if index.contains_key(note_id) || legacy_ids.contains(note_id) {
                outcome.notes_skipped += 1;
                continue;
            }
            let mut meta = meta.clone();
            meta.id = note_id.clone();
            meta.share_id = None;
            meta.normalize();
            index.insert(note_id.clone(), meta);
            outcome.notes_added += 1;
        }

        if outcome.notes_added > 0 {
            self.save_index(user_id, &index).await?;
        }
        debug!("Merged snapshot for {}: {:?}", user_id, outcome);
        Ok(outcome)
    }

    /// Rewrites every legacy-only note in the current layout, keeping its
    /// timestamps, then removes its legacy documents.
    pub async fn migrate_legacy(&self, user_id: &str) -> Result<usize> {
        validate_user_id(user_id)?;

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        self.ensure_layout(user_id).await?;

        let notes_dir = self.notes_dir(user_id);
        let mut index = self.load_index(user_id).await?;
        let mut migrated = Vec::new();

        for note_id in self.legacy.scan(&notes_dir).await? {
            if index.contains_key(&note_id) {
                continue;
            }
            let note = match self.legacy.read(&notes_dir, user_id, &note_id).await {
                Ok(note) => note,
                Err(e) => {
                    warn!("Cannot migrate {}/{}: {}", user_id, note_id, e);
                    continue;
                }
            };
            write_atomic(
                &self.content_path(user_id, &note_id),
                note.content.into_bytes(),
            )
            .await?;
            index.insert(note_id.clone(), note.meta);
            migrated.push(note_id);
        }

        if migrated.is_empty() {
            return Ok(0);
        }
        self.save_index(user_id, &index).await?;

        for note_id in &migrated {
            for path in self.legacy.document_paths(&notes_dir, note_id) {
                if let Err(e) = remove_file_if_exists(&path).await {
                    warn!("Failed to remove legacy document {}: {}", path.display(), e);
                }
            }
            let _ = tokio::fs::remove_dir(notes_dir.join(note_id)).await;
        }

        info!("Migrated {} legacy notes for {}", migrated.len(), user_id);
        Ok(migrated.len())
    }

    /// Indexes content files that have no index entry. The title comes from
    /// the first markdown heading, timestamps from the file.
    pub async fn adopt_orphans(&self, user_id: &str) -> Result<usize> {
        validate_user_id(user_id)?;

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        self.ensure_layout(user_id).await?;

        let mut index = self.load_index(user_id).await?;
        let mut adopted = 0;

        for path in list_files(&self.notes_dir(user_id)).await? {
            if !path.extension().is_some_and(|ext| ext == "md") {
                continue;
            }
            let Some(note_id) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if validate_id(&note_id).is_err() || index.contains_key(&note_id) {
                continue;
            }

            let content = match tokio::fs::read(&path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    warn!("Cannot adopt {}: {}", path.display(), e);
                    continue;
                }
            };
            let (created_at, updated_at) = file_times(&path).await;
            let mut meta = NoteMeta::new(
                note_id.clone(),
                first_heading(&content).unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            );
            meta.created_at = created_at;
            meta.updated_at = updated_at;
            meta.normalize();
            index.insert(note_id, meta);
            adopted += 1;
        }

        if adopted > 0 {
            self.save_index(user_id, &index).await?;
            info!("Adopted {} orphan content files for {}", adopted, user_id);
        }
        Ok(adopted)
    }

    /// Stores an uploaded file under the note's media directory.
    pub async fn save_media(
        &self,
        user_id: &str,
        note_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<MediaRef> {
        validate_user_id(user_id)?;
        validate_id(note_id)?;
        let cleaned = sanitize_file_name(file_name)
            .ok_or_else(|| NotesError::validation("file name must not be empty"))?;

        self.ensure(user_id).await?;

        let stored = format!("{}-{}", Utc::now().timestamp_millis(), cleaned);
        let path = self.media_dir(user_id, note_id).join(&stored);
        write_atomic(&path, bytes).await?;
        info!("Stored media {} for {}/{}", stored, user_id, note_id);

        Ok(MediaRef {
            user_id: user_id.to_string(),
            note_id: note_id.to_string(),
            url_path: format!("/media/{}/{}/{}", user_id, note_id, stored),
            file_name: stored,
        })
    }

    /// Writes a media file under its exact name unless one already exists.
    /// Used when restoring archives. Returns whether it was written.
    pub async fn restore_media(
        &self,
        user_id: &str,
        note_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<bool> {
        validate_user_id(user_id)?;
        validate_id(note_id)?;
        if sanitize_file_name(file_name).as_deref() != Some(file_name) {
            return Err(NotesError::validation(format!(
                "unsafe media file name {:?}",
                file_name
            )));
        }

        self.ensure(user_id).await?;
        let path = self.media_dir(user_id, note_id).join(file_name);
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        write_atomic(&path, bytes).await?;
        Ok(true)
    }

    pub async fn list_media(&self, user_id: &str, note_id: &str) -> Result<Vec<String>> {
        validate_user_id(user_id)?;
        validate_id(note_id)?;
        Ok(list_files(&self.media_dir(user_id, note_id))
            .await?
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect())
    }

    pub async fn read_media(&self, user_id: &str, note_id: &str, file_name: &str) -> Result<Vec<u8>> {
        let not_found = || NotesError::note_not_found(user_id, note_id);
        if validate_user_id(user_id).is_err() || validate_id(note_id).is_err() {
            return Err(not_found());
        }
        if sanitize_file_name(file_name).as_deref() != Some(file_name) {
            return Err(not_found());
        }
        read_optional(&self.media_dir(user_id, note_id).join(file_name))
            .await?
            .ok_or_else(not_found)
    }
}

/// Reduces an uploaded file name to a safe single path component.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Text of the first markdown heading, if any.
pub fn first_heading(markdown: &str) -> Option<String> {
    let mut in_heading = false;
    let mut text = String::new();
    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Heading { .. }) => in_heading = true,
            Event::End(TagEnd::Heading(_)) => {
                let title = text.trim();
                if !title.is_empty() {
                    return Some(title.to_string());
                }
                in_heading = false;
            }
            Event::Text(t) | Event::Code(t) if in_heading => text.push_str(&t),
            _ => {}
        }
    }
    None
}

async fn file_times(path: &Path) -> (DateTime<Utc>, DateTime<Utc>) {
    match tokio::fs::metadata(path).await {
        Ok(meta) => {
            let modified: DateTime<Utc> = meta
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            let created: DateTime<Utc> = meta.created().map(DateTime::from).unwrap_or(modified);
            (created.min(modified), modified)
        }
        Err(_) => {
            let now = Utc::now();
            (now, now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, Protection};
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<SystemRegistry>, UserStore) {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(SystemRegistry::new(Arc::new(MemoryStore::new())));
        let store = UserStore::new(dir.path().join("users"), Arc::clone(&registry));
        (dir, registry, store)
    }

    fn groceries() -> Note {
        let mut note = Note::new("Groceries");
        note.content = "- milk\n- eggs".to_string();
        note.meta.tags = vec!["home".to_string()];
        note.meta.groups = vec!["errands".to_string()];
        note
    }

    #[tokio::test]
    async fn ensure_creates_layout_and_registers() {
        let (dir, registry, store) = setup();
        store.ensure("alice").await.unwrap();
        store.ensure("alice").await.unwrap();

        let user_dir = dir.path().join("users/alice");
        assert!(user_dir.join("index.json").is_file());
        assert!(user_dir.join("notes").is_dir());
        assert!(user_dir.join("media").is_dir());
        assert_eq!(registry.list_all().await.unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, _registry, store) = setup();
        let note = groceries();
        let id = note.id().to_string();

        let stored = store
            .write("alice", &id, WriteMode::Replace(note.clone()))
            .await
            .unwrap();
        let read = store.read("alice", &id).await.unwrap();

        assert_eq!(read, stored);
        assert_eq!(read.meta.title, "Groceries");
        assert_eq!(read.content, "- milk\n- eggs");
        assert_eq!(read.meta.tags, vec!["home"]);
        assert_eq!(read.meta.created_at, note.meta.created_at);
        assert!(read.meta.updated_at >= note.meta.updated_at);
    }

    #[tokio::test]
    async fn unknown_user_reads_are_empty_not_errors() {
        let (dir, registry, store) = setup();
        assert!(store.list("nobody").await.unwrap().is_empty());
        assert!(store.read("nobody", "abc").await.unwrap_err().is_not_found());
        assert!(!dir.path().join("users/nobody").exists());
        assert!(registry.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_content_reads_as_empty() {
        let (dir, _registry, store) = setup();
        let note = groceries();
        let id = note.id().to_string();
        store.write("alice", &id, WriteMode::Replace(note)).await.unwrap();
        fs::remove_file(dir.path().join(format!("users/alice/notes/{}.md", id))).unwrap();

        let read = store.read("alice", &id).await.unwrap();
        assert_eq!(read.content, "");
        assert_eq!(read.meta.title, "Groceries");
    }

    #[tokio::test]
    async fn list_is_most_recent_first() {
        let (_dir, _registry, store) = setup();
        let first = Note::new("first");
        let second = Note::new("second");
        store
            .write("alice", &first.meta.id.clone(), WriteMode::Replace(first.clone()))
            .await
            .unwrap();
        store
            .write("alice", &second.meta.id.clone(), WriteMode::Replace(second))
            .await
            .unwrap();
        store
            .write(
                "alice",
                first.id(),
                WriteMode::Patch(NotePatch {
                    content: Some("touched".to_string()),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        let titles: Vec<_> = store
            .list("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.title)
            .collect();
        assert_eq!(titles, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn patch_upserts_and_preserves_fields() {
        let (_dir, _registry, store) = setup();
        let created = store
            .write(
                "alice",
                "abc123",
                WriteMode::Patch(NotePatch {
                    protection: Some(Protection::Enabled {
                        password_hash: "hash".to_string(),
                    }),
                    share_id: Some(Some("tok".to_string())),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(created.meta.title, DEFAULT_TITLE);

        let updated = store
            .write(
                "alice",
                "abc123",
                WriteMode::Patch(NotePatch {
                    title: Some("Renamed".to_string()),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.meta.title, "Renamed");
        assert_eq!(updated.meta.created_at, created.meta.created_at);
        assert_eq!(updated.meta.share_id.as_deref(), Some("tok"));
        assert_eq!(updated.meta.password_hash.as_deref(), Some("hash"));
    }

    #[tokio::test]
    async fn replace_drops_hash_when_unprotected() {
        let (_dir, _registry, store) = setup();
        let mut note = groceries();
        note.meta.password_hash = Some("leftover".to_string());
        let id = note.id().to_string();

        let stored = store.write("alice", &id, WriteMode::Replace(note)).await.unwrap();
        assert_eq!(stored.meta.password_hash, None);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_removes_everything() {
        let (dir, _registry, store) = setup();
        let note = groceries();
        let id = note.id().to_string();
        store.write("alice", &id, WriteMode::Replace(note)).await.unwrap();
        store
            .save_media("alice", &id, "photo.png", vec![1, 2, 3])
            .await
            .unwrap();

        store.delete("alice", &id).await.unwrap();
        store.delete("alice", &id).await.unwrap();
        store.delete("alice", "neverexisted").await.unwrap();
        store.delete("bob", "neverexisted").await.unwrap();

        assert!(store.read("alice", &id).await.unwrap_err().is_not_found());
        assert!(store.list("alice").await.unwrap().is_empty());
        let user_dir = dir.path().join("users/alice");
        assert!(!user_dir.join(format!("notes/{}.md", id)).exists());
        assert!(!user_dir.join(format!("media/{}", id)).exists());
    }

    #[tokio::test]
    async fn share_id_is_claimed_once_and_released() {
        let (_dir, _registry, store) = setup();
        let note = groceries();
        let id = note.id().to_string();
        store.write("alice", &id, WriteMode::Replace(note)).await.unwrap();

        assert_eq!(store.claim_share_id("alice", &id, "t1", None).await.unwrap(), "t1");
        assert_eq!(store.claim_share_id("alice", &id, "t2", None).await.unwrap(), "t1");
        assert_eq!(
            store.claim_share_id("alice", &id, "t3", Some("t1")).await.unwrap(),
            "t3"
        );
        assert_eq!(
            store.read("alice", &id).await.unwrap().meta.share_id.as_deref(),
            Some("t3")
        );

        assert_eq!(
            store.release_share_id("alice", &id).await.unwrap().as_deref(),
            Some("t3")
        );
        assert_eq!(store.release_share_id("alice", &id).await.unwrap(), None);
        assert!(store
            .claim_share_id("alice", "missing", "t4", None)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store.read("alice", "missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_reports_the_share_id_it_removed() {
        let (_dir, _registry, store) = setup();
        let note = groceries();
        let id = note.id().to_string();
        store.write("alice", &id, WriteMode::Replace(note)).await.unwrap();
        store.claim_share_id("alice", &id, "tok", None).await.unwrap();

        assert_eq!(store.delete("alice", &id).await.unwrap().as_deref(), Some("tok"));
        assert_eq!(store.delete("alice", &id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn merge_writes_content_only_for_new_indexed_notes() {
        let (dir, _registry, store) = setup();
        store.ensure("alice").await.unwrap();
        let notes_dir = dir.path().join("users/alice/notes");
        fs::write(
            notes_dir.join("old1.json"),
            r#"{"title":"Old","content":"legacy body"}"#,
        )
        .unwrap();

        let mut snapshot = UserSnapshot::default();
        snapshot.index.insert(
            "old1".to_string(),
            NoteMeta::new("old1".to_string(), "Old".to_string()),
        );
        snapshot.contents.insert("old1".to_string(), "from backup".to_string());
        snapshot.contents.insert("loose".to_string(), "no entry".to_string());

        let outcome = store.merge("alice", &snapshot).await.unwrap();
        assert_eq!(outcome.notes_added, 0);
        assert_eq!(outcome.notes_skipped, 1);
        assert_eq!(outcome.contents_written, 0);
        assert!(!notes_dir.join("old1.md").exists());
        assert!(!notes_dir.join("loose.md").exists());
        assert_eq!(store.read("alice", "old1").await.unwrap().content, "legacy body");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_to_one_user_lose_nothing() {
        let (_dir, _registry, store) = setup();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..24 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut note = Note::new(&format!("note {}", i));
                note.content = format!("body {}", i);
                let id = note.id().to_string();
                store
                    .write("alice", &id, WriteMode::Replace(note))
                    .await
                    .unwrap();
                let read = store.read("alice", &id).await.unwrap();
                assert_eq!(read.content, format!("body {}", i));
                id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }

        let listed = store.list("alice").await.unwrap();
        assert_eq!(listed.len(), 24);
        for id in ids {
            assert!(listed.iter().any(|m| m.id == id));
        }
    }

    #[tokio::test]
    async fn malformed_index_is_empty_for_reads_and_fatal_for_writes() {
        let (dir, _registry, store) = setup();
        store.ensure("alice").await.unwrap();
        fs::write(dir.path().join("users/alice/index.json"), "{ torn write").unwrap();

        assert!(store.list("alice").await.unwrap().is_empty());
        let err = store
            .write("alice", "abc", WriteMode::Replace(Note::new("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, NotesError::Malformed { .. }));
        assert_eq!(
            fs::read_to_string(dir.path().join("users/alice/index.json")).unwrap(),
            "{ torn write"
        );
    }

    #[tokio::test]
    async fn legacy_notes_read_through_and_migrate() {
        let (dir, _registry, store) = setup();
        let notes_dir = dir.path().join("users/alice/notes");
        fs::create_dir_all(notes_dir.join("split1")).unwrap();
        fs::write(
            notes_dir.join("split1/meta.json"),
            r#"{"title":"Groceries","tags":["home"],"createdAt":"2020-01-01T00:00:00Z","updatedAt":"2020-01-02T00:00:00Z"}"#,
        )
        .unwrap();
        fs::write(notes_dir.join("split1/content.md"), "- milk\n- eggs").unwrap();
        fs::write(
            notes_dir.join("combo1.json"),
            r#"{"title":"Groceries","tags":["home"],"content":"- milk\n- eggs","createdAt":"2020-01-01T00:00:00Z","updatedAt":"2020-01-02T00:00:00Z"}"#,
        )
        .unwrap();

        let split = store.read("alice", "split1").await.unwrap();
        let combo = store.read("alice", "combo1").await.unwrap();
        assert_eq!(split.content, combo.content);
        assert_eq!(split.meta.title, combo.meta.title);
        assert_eq!(split.meta.tags, combo.meta.tags);
        assert_eq!(split.meta.updated_at, combo.meta.updated_at);
        // reads leave the legacy documents alone
        assert!(notes_dir.join("combo1.json").exists());
        assert!(store.list("alice").await.unwrap().is_empty());

        assert_eq!(store.migrate_legacy("alice").await.unwrap(), 2);
        assert!(!notes_dir.join("combo1.json").exists());
        assert!(!notes_dir.join("split1").exists());

        let migrated = store.read("alice", "split1").await.unwrap();
        assert_eq!(migrated.content, "- milk\n- eggs");
        assert_eq!(migrated.meta.updated_at, split.meta.updated_at);
        assert_eq!(store.list("alice").await.unwrap().len(), 2);
        assert_eq!(store.migrate_legacy("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn orphans_are_invisible_until_adopted() {
        let (dir, _registry, store) = setup();
        store.ensure("alice").await.unwrap();
        fs::write(
            dir.path().join("users/alice/notes/orphan1.md"),
            "intro\n\n## Trip `plan`\n\nbody",
        )
        .unwrap();

        assert!(store.list("alice").await.unwrap().is_empty());
        assert_eq!(store.adopt_orphans("alice").await.unwrap(), 1);

        let listed = store.list("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "Trip plan");
        assert_eq!(store.adopt_orphans("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn merge_only_adds_missing_entries() {
        let (_dir, _registry, store) = setup();
        let local = store
            .write("alice", "n1", WriteMode::Replace(Note::new("local")))
            .await
            .unwrap();

        let mut snapshot = UserSnapshot::default();
        let mut theirs = NoteMeta::new("n1".to_string(), "theirs".to_string());
        snapshot.index.insert("n1".to_string(), theirs.clone());
        theirs.id = "n2".to_string();
        theirs.share_id = Some("foreign".to_string());
        snapshot.index.insert("n2".to_string(), theirs);
        snapshot.contents.insert("n1".to_string(), "overwrite?".to_string());
        snapshot.contents.insert("n2".to_string(), "new body".to_string());

        let outcome = store.merge("alice", &snapshot).await.unwrap();
        assert_eq!(outcome.notes_added, 1);
        assert_eq!(outcome.notes_skipped, 1);
        assert_eq!(outcome.contents_written, 1);

        assert_eq!(store.read("alice", "n1").await.unwrap(), local);
        let added = store.read("alice", "n2").await.unwrap();
        assert_eq!(added.content, "new body");
        assert_eq!(added.meta.share_id, None);

        let again = store.merge("alice", &snapshot).await.unwrap();
        assert_eq!(again.notes_added, 0);
        assert_eq!(again.contents_written, 0);
    }

    #[tokio::test]
    async fn media_names_are_sanitized() {
        let (_dir, _registry, store) = setup();
        let media = store
            .save_media("alice", "abc", "../../evil name.png", b"png".to_vec())
            .await
            .unwrap();
        assert!(media.file_name.ends_with("-evil_name.png"));
        assert_eq!(
            media.url_path,
            format!("/media/alice/abc/{}", media.file_name)
        );
        assert_eq!(
            store.read_media("alice", "abc", &media.file_name).await.unwrap(),
            b"png".to_vec()
        );
        assert_eq!(
            store.list_media("alice", "abc").await.unwrap(),
            vec![media.file_name.clone()]
        );
        assert!(store.read_media("alice", "abc", "../index.json").await.is_err());
        assert!(store.save_media("alice", "abc", "///", vec![]).await.is_err());
    }

    #[test]
    fn first_heading_skips_body_text() {
        assert_eq!(first_heading("# Title\ntext"), Some("Title".to_string()));
        assert_eq!(first_heading("no heading"), None);
    }
}
