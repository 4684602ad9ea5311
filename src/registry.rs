//! Installation-wide list of user identifiers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::{to_value, validate_user_id, KeyValueStore, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Registration {
    registered_at: DateTime<Utc>,
}

/// Tracks every user that has a store. Used for enumeration during backup
/// and housekeeping, never for access control.
pub struct SystemRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl SystemRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Adds the user if absent. Returns whether it was newly registered.
    pub async fn register(&self, user_id: &str) -> Result<bool> {
        validate_user_id(user_id)?;
        let entry = to_value(&Registration {
            registered_at: Utc::now(),
        })?;
        let added = self.store.put_if_absent(user_id, entry).await?;
        if added {
            info!("Registered user {}", user_id);
        }
        Ok(added)
    }

    pub async fn contains(&self, user_id: &str) -> Result<bool> {
        Ok(self.store.get(user_id).await?.is_some())
    }

    /// All registered user ids, sorted.
    pub async fn list_all(&self) -> Result<Vec<String>> {
        self.store.keys().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JsonFileStore, MemoryStore};
    use tempfile::TempDir;

    #[tokio::test]
    async fn register_is_idempotent() {
        let registry = SystemRegistry::new(Arc::new(MemoryStore::new()));
        assert!(registry.register("bob").await.unwrap());
        assert!(registry.register("alice").await.unwrap());
        assert!(!registry.register("bob").await.unwrap());

        assert_eq!(registry.list_all().await.unwrap(), vec!["alice", "bob"]);
        assert!(registry.contains("alice").await.unwrap());
        assert!(!registry.contains("carol").await.unwrap());
    }

    #[tokio::test]
    async fn registrations_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.json");
        SystemRegistry::new(Arc::new(JsonFileStore::new(&path)))
            .register("alice")
            .await
            .unwrap();

        let reopened = SystemRegistry::new(Arc::new(JsonFileStore::new(&path)));
        assert_eq!(reopened.list_all().await.unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn rejects_unsafe_user_ids() {
        let registry = SystemRegistry::new(Arc::new(MemoryStore::new()));
        assert!(registry.register("").await.is_err());
        assert!(registry.register("../root").await.is_err());
        assert!(registry.list_all().await.unwrap().is_empty());
    }
}
