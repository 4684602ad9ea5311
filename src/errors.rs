//! Error types for the mdnotes storage engine.
//!
//! Every operation reports failures through [`NotesError`]. Callers that sit at
//! an API boundary should use [`NotesError::public_message`] rather than the
//! `Display` output, which may include filesystem paths.

use std::{io, path::PathBuf};

use thiserror::Error;

/// The main error type for mdnotes.
#[derive(Error, Debug)]
pub enum NotesError {
    /// Errors related to file I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to serialization/deserialization operations.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors related to zip operations.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A blocking task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Note was not found in the index or in any legacy shape.
    #[error("Note not found: {user_id}/{note_id}")]
    NoteNotFound { user_id: String, note_id: String },

    /// Share token is unknown or has been revoked.
    #[error("Share not found: {token}")]
    ShareNotFound { token: String },

    #[error("Account not found: {username}")]
    AccountNotFound { username: String },

    #[error("Account already exists: {username}")]
    AccountExists { username: String },

    /// An on-disk document exists but could not be parsed.
    #[error("Malformed document {}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },

    /// The note is password protected and no password was supplied.
    #[error("Password required")]
    PasswordRequired,

    #[error("Invalid password")]
    InvalidPassword,

    /// Caller-supplied data violates a constraint.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Password hashing failed: {message}")]
    PasswordHash { message: String },

    /// Errors related to backup operations.
    #[error("Backup failed: {message}")]
    BackupFailed { message: String },

    /// Error when attempting to restore from backup.
    #[error("Restore failed: {message}")]
    RestoreFailed { message: String },

    /// Errors related to configuration.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Directory creation or access failed.
    #[error("Failed to create or access directory: {}", path.display())]
    DirectoryError { path: PathBuf },
}

impl NotesError {
    pub fn validation(message: impl Into<String>) -> Self {
        NotesError::Validation {
            message: message.into(),
        }
    }

    pub fn note_not_found(user_id: &str, note_id: &str) -> Self {
        NotesError::NoteNotFound {
            user_id: user_id.to_string(),
            note_id: note_id.to_string(),
        }
    }

    /// True for every error a caller should present as "not found".
    ///
    /// Malformed documents count as missing on read paths.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            NotesError::NoteNotFound { .. }
                | NotesError::ShareNotFound { .. }
                | NotesError::AccountNotFound { .. }
                | NotesError::Malformed { .. }
        )
    }

    /// Message safe to show to an end user. Never contains filesystem paths.
    pub fn public_message(&self) -> String {
        match self {
            NotesError::NoteNotFound { .. } | NotesError::Malformed { .. } => {
                "note not found".to_string()
            }
            NotesError::ShareNotFound { .. } => "shared note not found".to_string(),
            NotesError::AccountNotFound { .. } => "account not found".to_string(),
            NotesError::AccountExists { .. } => "account already exists".to_string(),
            NotesError::PasswordRequired => "password required".to_string(),
            NotesError::InvalidPassword => "invalid password".to_string(),
            NotesError::Validation { message } | NotesError::ConfigError { message } => {
                message.clone()
            }
            _ => "internal server error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_counts_as_not_found() {
        let err = NotesError::Malformed {
            path: PathBuf::from("/srv/notes/users/alice/index.json"),
            message: "expected value".to_string(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.public_message(), "note not found");
    }

    #[test]
    fn io_errors_do_not_leak_paths() {
        let err = NotesError::DirectoryError {
            path: PathBuf::from("/srv/notes/users/alice"),
        };
        assert!(!err.is_not_found());
        assert_eq!(err.public_message(), "internal server error");
        assert!(err.to_string().contains("/srv/notes"));
    }
}
