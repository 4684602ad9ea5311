use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::{debug, error, trace};
use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;

use crate::{NotesError, Result};

/// Writes `bytes` to `path` atomically: a temporary file is created next to
/// the target, flushed and synced, then renamed over it. Readers see either
/// the old file or the complete new one.
pub async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &bytes)).await?
}

/// Blocking half of [`write_atomic`].
pub fn write_atomic_blocking(file_path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = file_path.parent().unwrap_or_else(|| Path::new("."));
    if !dir.exists() {
        debug!("Creating parent directory: {}", dir.display());
        fs::create_dir_all(dir).map_err(|e| {
            error!("Failed to create directory {}: {}", dir.display(), e);
            NotesError::DirectoryError {
                path: dir.to_path_buf(),
            }
        })?;
    }

    let mut temp_file = NamedTempFile::new_in(dir).map_err(|e| {
        error!("Failed to create temporary file in {}: {}", dir.display(), e);
        NotesError::Io(e)
    })?;

    trace!("Writing {} bytes to temporary file", bytes.len());
    temp_file.write_all(bytes)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;

    temp_file.persist(file_path).map_err(|e| {
        error!(
            "Failed to persist file {}: {}",
            file_path.display(),
            e.error
        );
        NotesError::Io(e.error)
    })?;

    trace!("Atomically wrote {}", file_path.display());
    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, json).await
}

/// Reads a whole file, mapping "does not exist" to `None`.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(NotesError::Io(e)),
    }
}

/// Reads and parses a JSON document. A document that exists but does not
/// parse is reported as [`NotesError::Malformed`].
pub async fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match read_optional(path).await? {
        Some(bytes) => parse_json(path, &bytes).map(Some),
        None => Ok(None),
    }
}

pub fn parse_json<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| NotesError::Malformed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Removes a file; returns whether it existed.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(NotesError::Io(e)),
    }
}

/// Removes a directory tree; returns whether it existed.
pub async fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(NotesError::Io(e)),
    }
}

/// Creates a directory tree, mapping failures to [`NotesError::DirectoryError`].
pub async fn ensure_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path).await.map_err(|e| {
        error!("Failed to create directory {}: {}", path.display(), e);
        NotesError::DirectoryError {
            path: path.to_path_buf(),
        }
    })
}

/// Lists the regular files directly inside `dir`. A missing directory is empty.
pub async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(NotesError::Io(e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

// Helper method for parsing tags
pub fn parse_tags(tags: Option<String>) -> Vec<String> {
    tags.map(|t| {
        t.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}
