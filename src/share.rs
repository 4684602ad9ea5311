//! Reverse index from public share tokens to (user, note) pairs.
//!
//! The registry does not know whether a note is already shared; the note's
//! own `share_id` field is the source of truth for that.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    get_typed, new_share_token, to_value, validate_id, validate_user_id, KeyValueStore,
    NotesError, Result,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareEntry {
    pub token: String,
    pub user_id: String,
    pub note_id: String,
    pub created_at: DateTime<Utc>,
}

pub struct ShareRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl ShareRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Persists a new entry under a fresh token and returns the token.
    pub async fn create(&self, user_id: &str, note_id: &str) -> Result<String> {
        validate_user_id(user_id)?;
        validate_id(note_id)?;

        loop {
            let token = new_share_token();
            let entry = ShareEntry {
                token: token.clone(),
                user_id: user_id.to_string(),
                note_id: note_id.to_string(),
                created_at: Utc::now(),
            };
            if self.store.put_if_absent(&token, to_value(&entry)?).await? {
                info!("Created share {} for {}/{}", token, user_id, note_id);
                return Ok(token);
            }
            debug!("Share token collision, drawing another");
        }
    }

    /// Looks up a token. Unknown, syntactically invalid and unreadable
    /// tokens are all reported as [`NotesError::ShareNotFound`].
    pub async fn resolve(&self, token: &str) -> Result<ShareEntry> {
        let not_found = || NotesError::ShareNotFound {
            token: token.to_string(),
        };
        if validate_id(token).is_err() {
            return Err(not_found());
        }

        match get_typed::<ShareEntry>(self.store.as_ref(), token).await {
            Ok(Some(entry)) => Ok(entry),
            Ok(None) => Err(not_found()),
            Err(e @ NotesError::Malformed { .. }) | Err(e @ NotesError::Serialization(_)) => {
                warn!("Unreadable share entry {}: {}", token, e);
                Err(not_found())
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes the entry. Already-absent tokens are fine.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        if validate_id(token).is_err() {
            return Ok(());
        }
        if self.store.remove(token).await? {
            info!("Revoked share {}", token);
        } else {
            debug!("Share {} was already revoked", token);
        }
        Ok(())
    }
}
