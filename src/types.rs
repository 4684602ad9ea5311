//! Shared data structures for the mdnotes service and command line.
//!
//! Request and response shapes used by [`NoteService`](crate::NoteService)
//! live here alongside the CLI subcommands.
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::Serialize;

use crate::NotesError;

/// A specialized Result type for mdnotes operations.
pub type Result<T> = std::result::Result<T, NotesError>;

/// What a save does to a note's password.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PasswordIntent {
    /// Leave protection as stored
    #[default]
    Keep,
    /// Protect the note with this plaintext password
    Set(String),
    /// Drop protection and the stored hash
    Remove,
}

/// Field-level update for a note. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveRequest {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub groups: Option<Vec<String>>,
    pub password: PasswordIntent,
}

impl SaveRequest {
    pub fn content(content: impl Into<String>) -> Self {
        SaveRequest {
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

/// What an anonymous reader of a share link gets to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedNote {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub groups: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of upgrading one user's notes to the current layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSummary {
    /// Legacy notes rewritten as index entry + content file
    pub migrated: usize,
    /// Content files without an index entry that were indexed
    pub adopted: usize,
}

/// Available subcommands for the mdnotes application
#[derive(Subcommand)]
pub enum Commands {
    /// List every known user
    Users {
        /// Format output as JSON
        #[clap(short, long)]
        json: bool,
    },

    /// Create an account
    CreateUser {
        /// Account name, also the user id
        username: String,

        /// Login password
        #[clap(short, long)]
        password: String,

        /// Grant administrator rights
        #[clap(long)]
        admin: bool,
    },

    /// Delete an account (the user's notes are kept)
    DeleteUser {
        username: String,
    },

    /// List a user's notes, most recently updated first
    List {
        /// Owner of the notes
        #[clap(short, long)]
        user: String,

        /// Filter notes by tag
        #[clap(short, long)]
        tag: Option<String>,

        /// Limit the number of notes returned
        #[clap(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// Format output as JSON
        #[clap(short, long)]
        json: bool,

        /// Only show note IDs and titles
        #[clap(short, long)]
        brief: bool,
    },

    /// View a note by ID
    View {
        #[clap(short, long)]
        user: String,

        /// ID of the note to view
        id: String,

        /// Format output as raw JSON
        #[clap(short, long)]
        json: bool,
    },

    /// Create a new note
    Create {
        #[clap(short, long)]
        user: String,

        /// Title of the note
        #[clap(short = 'T', long, default_value = "")]
        title: String,

        /// Content of the note, can be markdown formatted
        #[clap(short, long)]
        content: Option<String>,

        /// Path to a markdown file to use as content
        #[clap(short, long)]
        file: Option<PathBuf>,

        /// Tags to associate with the note (comma-separated)
        #[clap(short = 't', long)]
        tags: Option<String>,

        /// Groups to put the note in (comma-separated)
        #[clap(short, long)]
        groups: Option<String>,

        /// Protect shared views of the note with a password
        #[clap(short, long)]
        password: Option<String>,
    },

    /// Search a user's notes by title, content, tags and groups
    Search {
        #[clap(short, long)]
        user: String,

        /// Search query text
        query: String,

        /// Limit the number of search results
        #[clap(short = 'n', long, default_value_t = 10)]
        limit: usize,

        /// Format output as JSON
        #[clap(short, long)]
        json: bool,
    },

    /// Delete a note by ID
    Delete {
        #[clap(short, long)]
        user: String,

        /// ID of the note to delete
        id: String,

        /// Skip confirmation prompt
        #[clap(short, long)]
        force: bool,
    },

    /// Create (or revoke) a public share link for a note
    Share {
        #[clap(short, long)]
        user: String,

        id: String,

        /// Revoke the existing link instead
        #[clap(short, long)]
        revoke: bool,
    },

    /// Open a share link the way an anonymous reader would
    Resolve {
        token: String,

        /// Password for protected notes
        #[clap(short, long)]
        password: Option<String>,
    },

    /// Export everything to a JSON document or a ZIP archive
    Export {
        /// Path of the export file; a `.zip` extension writes an archive
        #[clap(short, long)]
        output: PathBuf,
    },

    /// Merge a JSON document or ZIP archive into this installation
    Import {
        /// Path to the backup file
        source: PathBuf,
    },

    /// Upgrade legacy notes and index orphaned content files
    Migrate {
        /// Only this user (default: every registered user)
        #[clap(short, long)]
        user: Option<String>,
    },

    /// Create a backup archive
    Backup {
        /// Path for the backup file (default uses config setting)
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Keep running and create scheduled backups until interrupted
    Daemon {
        /// Also create a backup right away
        #[clap(long)]
        backup_now: bool,
    },

    /// Configuration management
    Config {
        /// Show current configuration
        #[clap(short = 'S', long)]
        show: bool,

        /// Update a configuration setting (key=value)
        #[clap(short, long)]
        set: Option<String>,

        /// Reset configuration to defaults
        #[clap(short, long)]
        reset: bool,
    },
}
