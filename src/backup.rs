//! Whole-installation export and additive import.
//!
//! The JSON [`BackupDocument`] carries accounts, the user list and every
//! user's notes. The archive form wraps that document in a ZIP together with
//! the media files, and is what scheduled backups write.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BTreeMap, BinaryHeap, HashSet},
    fs::File,
    io::{Read, Write},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use walkdir::WalkDir;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{Account, AccountStore, NoteMeta, NotesError, Result, SystemRegistry, UserStore};

pub const BACKUP_VERSION: u32 = 1;
const DOCUMENT_ENTRY: &str = "backup.json";
const MEDIA_PREFIX: &str = "media";
const ARCHIVE_PREFIX: &str = "mdnotes_backup_";

/// One user's notes: metadata keyed by id, and content keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    #[serde(default)]
    pub index: BTreeMap<String, NoteMeta>,
    #[serde(default)]
    pub contents: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDocument {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub notes: BTreeMap<String, UserSnapshot>,
}

impl BackupDocument {
    pub fn note_count(&self) -> usize {
        self.notes.values().map(|s| s.index.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub accounts_imported: usize,
    pub accounts_skipped: usize,
    pub users_registered: usize,
    pub notes_imported: usize,
    pub notes_skipped: usize,
    pub contents_written: usize,
    pub media_written: usize,
    /// (user id, error message)
    pub failed_users: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub users: usize,
    pub notes: usize,
    pub media_files: usize,
}

struct MediaEntry {
    user_id: String,
    note_id: String,
    file_name: String,
    bytes: Vec<u8>,
}

pub struct BackupCodec {
    accounts: Arc<AccountStore>,
    registry: Arc<SystemRegistry>,
    store: Arc<UserStore>,
}

impl BackupCodec {
    pub fn new(
        accounts: Arc<AccountStore>,
        registry: Arc<SystemRegistry>,
        store: Arc<UserStore>,
    ) -> Self {
        Self {
            accounts,
            registry,
            store,
        }
    }

    /// Builds a backup document of everything currently stored.
    pub async fn export(&self) -> Result<BackupDocument> {
        let accounts = self.accounts.list().await?;
        let users = self.registry.list_all().await?;
        let mut notes = BTreeMap::new();

        for user_id in &users {
            match self.snapshot(user_id).await {
                Ok(snapshot) => {
                    notes.insert(user_id.clone(), snapshot);
                }
                Err(e) => warn!("Leaving {} out of the export: {}", user_id, e),
            }
        }

        let document = BackupDocument {
            version: BACKUP_VERSION,
            exported_at: Utc::now(),
            accounts,
            users,
            notes,
        };
        info!(
            "Exported {} accounts, {} users, {} notes",
            document.accounts.len(),
            document.users.len(),
            document.note_count()
        );
        Ok(document)
    }

    async fn snapshot(&self, user_id: &str) -> Result<UserSnapshot> {
        let mut snapshot = UserSnapshot::default();

        for (note_id, meta) in self.store.load_index(user_id).await? {
            match self.store.read_content(user_id, &note_id).await {
                Ok(content) => {
                    if let Some(content) = content {
                        snapshot.contents.insert(note_id.clone(), content);
                    }
                    snapshot.index.insert(note_id, meta);
                }
                Err(e) => warn!("Skipping note {}/{} in export: {}", user_id, note_id, e),
            }
        }

        for note in self.store.legacy_notes(user_id).await? {
            let note_id = note.meta.id.clone();
            snapshot.contents.insert(note_id.clone(), note.content);
            snapshot.index.insert(note_id, note.meta);
        }

        debug!("Snapshot of {} has {} notes", user_id, snapshot.index.len());
        Ok(snapshot)
    }

    /// Merges a backup document into the installation. Nothing that exists
    /// locally is overwritten, so importing the same document twice has the
    /// same effect as importing it once.
    pub async fn import(&self, document: &BackupDocument) -> Result<ImportSummary> {
        if document.version > BACKUP_VERSION {
            return Err(NotesError::RestoreFailed {
                message: format!("unsupported backup version {}", document.version),
            });
        }

        let mut summary = ImportSummary::default();

        for account in &document.accounts {
            match self.accounts.insert_if_absent(account).await {
                Ok(true) => summary.accounts_imported += 1,
                Ok(false) => summary.accounts_skipped += 1,
                Err(e) => {
                    warn!("Skipping account {:?}: {}", account.username, e);
                    summary.accounts_skipped += 1;
                }
            }
        }

        let mut seen = HashSet::new();
        let users = document
            .users
            .iter()
            .chain(document.notes.keys())
            .filter(|user_id| seen.insert(user_id.as_str()));
        for user_id in users {
            match self.registry.register(user_id).await {
                Ok(true) => summary.users_registered += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Cannot register {:?}: {}", user_id, e);
                    summary.failed_users.push((user_id.clone(), e.to_string()));
                }
            }
        }

        for (user_id, snapshot) in &document.notes {
            match self.store.merge(user_id, snapshot).await {
                Ok(outcome) => {
                    summary.notes_imported += outcome.notes_added;
                    summary.notes_skipped += outcome.notes_skipped;
                    summary.contents_written += outcome.contents_written;
                }
                Err(e) => {
                    error!("Import failed for {}: {}", user_id, e);
                    if !summary.failed_users.iter().any(|(u, _)| u == user_id) {
                        summary.failed_users.push((user_id.clone(), e.to_string()));
                    }
                }
            }
        }

        info!(
            "Imported {} notes ({} skipped), {} accounts, {} failed users",
            summary.notes_imported,
            summary.notes_skipped,
            summary.accounts_imported,
            summary.failed_users.len()
        );
        Ok(summary)
    }

    /// Writes the backup document and every media file into a ZIP archive.
    pub async fn export_archive(&self, path: &Path) -> Result<ArchiveSummary> {
        let document = self.export().await?;
        let json = serde_json::to_vec_pretty(&document)?;
        let media_roots: Vec<(String, PathBuf)> = document
            .users
            .iter()
            .map(|user_id| (user_id.clone(), self.store.media_root(user_id)))
            .collect();

        let target = path.to_path_buf();
        let media_files = tokio::task::spawn_blocking(move || {
            write_archive_blocking(&target, &json, &media_roots)
        })
        .await??;

        let summary = ArchiveSummary {
            path: path.to_path_buf(),
            users: document.users.len(),
            notes: document.note_count(),
            media_files,
        };
        info!("Wrote backup archive {}: {:?}", path.display(), summary);
        Ok(summary)
    }

    /// Imports an archive written by [`export_archive`](Self::export_archive).
    /// Media files are restored only where no file of that name exists.
    pub async fn import_archive(&self, path: &Path) -> Result<ImportSummary> {
        let source = path.to_path_buf();
        let (document, media) =
            tokio::task::spawn_blocking(move || read_archive_blocking(&source)).await??;

        let mut summary = self.import(&document).await?;
        for entry in media {
            match self
                .store
                .restore_media(&entry.user_id, &entry.note_id, &entry.file_name, entry.bytes)
                .await
            {
                Ok(true) => summary.media_written += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "Skipping media {}/{}/{}: {}",
                    entry.user_id, entry.note_id, entry.file_name, e
                ),
            }
        }
        Ok(summary)
    }

    /// Writes a timestamped archive into `backup_dir`, then prunes the oldest
    /// archives beyond `max_backups` (0 keeps all).
    pub async fn create_full_backup(&self, backup_dir: &Path, max_backups: u32) -> Result<PathBuf> {
        tokio::fs::create_dir_all(backup_dir)
            .await
            .map_err(|e| NotesError::BackupFailed {
                message: e.to_string(),
            })?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let backup_path = backup_dir.join(format!("{}{}.zip", ARCHIVE_PREFIX, timestamp));
        self.export_archive(&backup_path).await?;

        let dir = backup_dir.to_path_buf();
        let removed =
            tokio::task::spawn_blocking(move || cleanup_old_backups(&dir, max_backups)).await??;
        if removed > 0 {
            info!("Removed {} old backups", removed);
        }
        Ok(backup_path)
    }
}

fn write_archive_blocking(
    path: &Path,
    json: &[u8],
    media_roots: &[(String, PathBuf)],
) -> Result<usize> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut zip = ZipWriter::new(NamedTempFile::new_in(parent)?);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    zip.start_file(DOCUMENT_ENTRY, options)?;
    zip.write_all(json)?;

    let mut media_files = 0;
    for (user_id, root) in media_roots {
        // media/<note>/<file>
        for entry in WalkDir::new(root)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            let name = format!("{}/{}/{}", MEDIA_PREFIX, user_id, parts.join("/"));

            let bytes = std::fs::read(entry.path())?;
            zip.start_file(name, options)?;
            zip.write_all(&bytes)?;
            media_files += 1;
        }
    }

    let temp = zip.finish()?;
    temp.persist(path).map_err(|e| NotesError::Io(e.error))?;
    Ok(media_files)
}

fn read_archive_blocking(path: &Path) -> Result<(BackupDocument, Vec<MediaEntry>)> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut document = None;
    let mut media = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = entry.enclosed_name() else {
            warn!("Ignoring archive entry outside the root: {:?}", entry.name());
            continue;
        };
        let parts: Vec<String> = name
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().to_string()),
                _ => None,
            })
            .collect();

        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;

        match parts.as_slice() {
            [doc] if doc == DOCUMENT_ENTRY => {
                document = Some(serde_json::from_slice::<BackupDocument>(&bytes).map_err(
                    |e| NotesError::RestoreFailed {
                        message: format!("{} is not a valid backup document: {}", DOCUMENT_ENTRY, e),
                    },
                )?);
            }
            [prefix, user_id, note_id, file_name] if prefix == MEDIA_PREFIX => {
                media.push(MediaEntry {
                    user_id: user_id.clone(),
                    note_id: note_id.clone(),
                    file_name: file_name.clone(),
                    bytes,
                });
            }
            _ => debug!("Ignoring archive entry {}", name.display()),
        }
    }

    let document = document.ok_or_else(|| NotesError::RestoreFailed {
        message: format!("archive has no {}", DOCUMENT_ENTRY),
    })?;
    Ok((document, media))
}

/// Deletes the oldest backup archives so that at most `max_backups` remain.
/// Returns how many were removed.
fn cleanup_old_backups(backup_dir: &Path, max_backups: u32) -> Result<usize> {
    if max_backups == 0 {
        return Ok(0);
    }

    #[derive(Debug, PartialEq, Eq)]
    struct BackupFile {
        modified_time: SystemTime,
        path: PathBuf,
    }

    impl PartialOrd for BackupFile {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for BackupFile {
        // Newer is greater; archive names carry the timestamp, so they break ties.
        fn cmp(&self, other: &Self) -> Ordering {
            self.modified_time
                .cmp(&other.modified_time)
                .then_with(|| self.path.cmp(&other.path))
        }
    }

    // Min-heap holding the newest `max_backups` archives seen so far.
    let mut newest: BinaryHeap<Reverse<BackupFile>> =
        BinaryHeap::with_capacity(max_backups as usize + 1);
    let mut evicted = Vec::new();

    for entry in WalkDir::new(backup_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        let path = entry.path();
        let is_backup = entry.file_type().is_file()
            && path.extension().is_some_and(|ext| ext == "zip")
            && path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(ARCHIVE_PREFIX));
        if !is_backup {
            continue;
        }
        let Some(modified_time) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
            continue;
        };

        newest.push(Reverse(BackupFile {
            modified_time,
            path: path.to_path_buf(),
        }));
        if newest.len() > max_backups as usize {
            if let Some(Reverse(oldest)) = newest.pop() {
                evicted.push(oldest.path);
            }
        }
    }

    let mut removed = 0;
    for path in evicted {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed old backup {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove old backup {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}
