//! Opaque identifiers for notes and share links, plus validation of
//! identifiers that arrive from callers, old installations or backups.
//!
//! Every identifier that reaches this crate ends up as a path component, so
//! validation here is what keeps `..` and separators out of the data directory.

use uuid::Uuid;

use crate::{NotesError, Result};

const MAX_ID_LEN: usize = 128;
const MAX_USER_LEN: usize = 64;

/// Generates a fresh note identifier: 32 lowercase hex characters.
pub fn new_note_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generates a fresh share token. Same shape as a note id, but drawn
/// independently so a token never reveals the note it points at.
pub fn new_share_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Checks a note identifier or share token: `[A-Za-z0-9_-]{1,128}`.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(NotesError::validation(format!(
            "identifier must be 1 to {} characters",
            MAX_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(NotesError::validation(
            "identifier may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

/// Checks that a user identifier is usable as a directory name.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err(NotesError::validation("username must not be empty"));
    }
    if trimmed != user_id {
        return Err(NotesError::validation(
            "username must not start or end with whitespace",
        ));
    }
    if user_id.chars().count() > MAX_USER_LEN {
        return Err(NotesError::validation(format!(
            "username must be at most {} characters",
            MAX_USER_LEN
        )));
    }
    if user_id.starts_with('.') {
        return Err(NotesError::validation("username must not start with '.'"));
    }
    if !user_id
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
    {
        return Err(NotesError::validation(
            "username may only contain letters, digits, '-', '_', '.' and '@'",
        ));
    }
    Ok(())
}
