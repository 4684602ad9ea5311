//! Account records: username, opaque credential hash, admin flag.
//!
//! Only the storage side lives here. Sessions and login flows belong to the
//! HTTP layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{get_typed, to_value, validate_user_id, KeyValueStore, NotesError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

pub struct AccountStore {
    store: Arc<dyn KeyValueStore>,
}

impl AccountStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Creates a new account. Fails with [`NotesError::AccountExists`] if the
    /// username is taken.
    pub async fn create(&self, account: Account) -> Result<()> {
        validate_user_id(&account.username)?;
        if account.password_hash.is_empty() {
            return Err(NotesError::validation("password must not be empty"));
        }
        if !self.insert_if_absent(&account).await? {
            return Err(NotesError::AccountExists {
                username: account.username,
            });
        }
        info!("Created account {}", account.username);
        Ok(())
    }

    /// Inserts the account unless the username exists. Used by backup import,
    /// where an existing local account always wins.
    pub async fn insert_if_absent(&self, account: &Account) -> Result<bool> {
        validate_user_id(&account.username)?;
        self.store
            .put_if_absent(&account.username, to_value(account)?)
            .await
    }

    pub async fn get(&self, username: &str) -> Result<Account> {
        get_typed(self.store.as_ref(), username)
            .await?
            .ok_or_else(|| NotesError::AccountNotFound {
                username: username.to_string(),
            })
    }

    pub async fn remove(&self, username: &str) -> Result<bool> {
        self.store.remove(username).await
    }

    /// All accounts, sorted by username. Unreadable records are skipped.
    pub async fn list(&self) -> Result<Vec<Account>> {
        let mut accounts = Vec::new();
        for username in self.store.keys().await? {
            match get_typed::<Account>(self.store.as_ref(), &username).await {
                Ok(Some(account)) => accounts.push(account),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable account {}: {}", username, e),
            }
        }
        Ok(accounts)
    }
}
