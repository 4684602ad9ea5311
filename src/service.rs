//! The public face of the storage engine.
//!
//! [`NoteService`] ties together the per-user stores, the registries, the
//! share links and the backup codec. It is what a web layer or the command
//! line talks to; nothing above it touches the filesystem directly.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use log::{debug, info, warn};

use crate::{
    first_heading, search_notes, Account, AccountStore, ArchiveSummary, Argon2Hashing,
    BackupCodec, BackupDocument, Config, ImportSummary, JsonDirStore, JsonFileStore,
    KeyValueStore, MediaRef, MigrationSummary, Note, NoteMeta, NotePatch, NotesError,
    PasswordHashing, PasswordIntent, Protection, Result, SaveRequest, SearchResult, SharedNote,
    ShareRegistry, SystemRegistry, UserStore, WriteMode,
};

/// Key-value stores backing the registries.
pub struct ServiceStores {
    pub accounts: Arc<dyn KeyValueStore>,
    pub users: Arc<dyn KeyValueStore>,
    pub shares: Arc<dyn KeyValueStore>,
}

pub struct NoteService {
    accounts: Arc<AccountStore>,
    registry: Arc<SystemRegistry>,
    shares: ShareRegistry,
    store: Arc<UserStore>,
    codec: BackupCodec,
    hasher: Arc<dyn PasswordHashing>,
    preview_length: usize,
}

impl NoteService {
    /// Binds the service to the file layout under `config.data_dir`.
    pub fn open(config: &Config) -> Self {
        info!("Opening note storage at {}", config.data_dir.display());
        let stores = ServiceStores {
            accounts: Arc::new(JsonFileStore::new(config.accounts_path())),
            users: Arc::new(JsonFileStore::new(config.registry_path())),
            shares: Arc::new(JsonDirStore::new(config.shares_dir())),
        };
        Self::with_parts(
            config.users_dir(),
            stores,
            Arc::new(Argon2Hashing::new()),
            config.preview_length,
        )
    }

    pub fn with_parts(
        users_dir: impl Into<PathBuf>,
        stores: ServiceStores,
        hasher: Arc<dyn PasswordHashing>,
        preview_length: usize,
    ) -> Self {
        let accounts = Arc::new(AccountStore::new(stores.accounts));
        let registry = Arc::new(SystemRegistry::new(stores.users));
        let store = Arc::new(UserStore::new(users_dir, registry.clone()));
        let codec = BackupCodec::new(accounts.clone(), registry.clone(), store.clone());
        Self {
            accounts,
            registry,
            shares: ShareRegistry::new(stores.shares),
            store,
            codec,
            hasher,
            preview_length,
        }
    }

    // Accounts

    pub async fn create_account(
        &self,
        username: &str,
        password: &str,
        is_admin: bool,
    ) -> Result<Account> {
        crate::validate_user_id(username)?;
        if password.is_empty() {
            return Err(NotesError::validation("password must not be empty"));
        }

        let account = Account {
            username: username.to_string(),
            password_hash: self.hash_password(password).await?,
            is_admin,
            created_at: Utc::now(),
        };
        self.accounts.create(account.clone()).await?;
        self.store.ensure(username).await?;
        Ok(account)
    }

    /// Removes the account. The user's notes stay on disk and in the
    /// registry, so they remain part of every export.
    pub async fn delete_account(&self, username: &str) -> Result<()> {
        if !self.accounts.remove(username).await? {
            return Err(NotesError::AccountNotFound {
                username: username.to_string(),
            });
        }
        info!("Deleted account {}; notes retained", username);
        Ok(())
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.accounts.list().await
    }

    /// False for unknown users as well as wrong passwords.
    pub async fn verify_login(&self, username: &str, password: &str) -> Result<bool> {
        match self.accounts.get(username).await {
            Ok(account) => self.verify_password(password, &account.password_hash).await,
            Err(e) if e.is_not_found() => {
                debug!("Login attempt for unknown account {:?}", username);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_users(&self) -> Result<Vec<String>> {
        self.registry.list_all().await
    }

    async fn hash_password(&self, password: &str) -> Result<String> {
        let hasher = Arc::clone(&self.hasher);
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password)).await?
    }

    async fn verify_password(&self, password: &str, hash: &str) -> Result<bool> {
        let hasher = Arc::clone(&self.hasher);
        let (password, hash) = (password.to_string(), hash.to_string());
        Ok(tokio::task::spawn_blocking(move || hasher.verify(&password, &hash)).await?)
    }

    // Notes

    pub async fn create_note(&self, user_id: &str, title: &str) -> Result<String> {
        let note = Note::new(title);
        let id = note.id().to_string();
        self.store.write(user_id, &id, WriteMode::Replace(note)).await?;
        Ok(id)
    }

    /// Stores a markdown document as a new note. A blank title is taken from
    /// the document's first heading.
    pub async fn import_markdown(&self, user_id: &str, title: &str, content: &str) -> Result<String> {
        let title = if title.trim().is_empty() {
            first_heading(content).unwrap_or_default()
        } else {
            title.to_string()
        };
        let mut note = Note::new(&title);
        note.content = content.to_string();
        let id = note.id().to_string();
        self.store.write(user_id, &id, WriteMode::Replace(note)).await?;
        Ok(id)
    }

    pub async fn read_note(&self, user_id: &str, note_id: &str) -> Result<Note> {
        self.store.read(user_id, note_id).await
    }

    /// Upserts a note from a field-level request.
    pub async fn save_note(&self, user_id: &str, note_id: &str, request: SaveRequest) -> Result<Note> {
        let protection = match request.password {
            PasswordIntent::Keep => None,
            PasswordIntent::Set(password) if password.is_empty() => {
                return Err(NotesError::validation("password must not be empty"));
            }
            PasswordIntent::Set(password) => Some(Protection::Enabled {
                password_hash: self.hash_password(&password).await?,
            }),
            PasswordIntent::Remove => Some(Protection::Disabled),
        };
        let patch = NotePatch {
            title: request.title,
            content: request.content,
            tags: request.tags,
            groups: request.groups,
            protection,
            share_id: None,
        };
        self.store.write(user_id, note_id, WriteMode::Patch(patch)).await
    }

    /// Deletes the note and revokes its share link. Deleting a missing note
    /// succeeds.
    pub async fn delete_note(&self, user_id: &str, note_id: &str) -> Result<()> {
        if let Some(token) = self.store.delete(user_id, note_id).await? {
            self.shares.revoke(&token).await?;
        }
        Ok(())
    }

    pub async fn list_notes(&self, user_id: &str) -> Result<Vec<NoteMeta>> {
        self.store.list(user_id).await
    }

    pub async fn search_notes(&self, user_id: &str, query: &str) -> Result<Vec<SearchResult>> {
        search_notes(&self.store, user_id, query, self.preview_length).await
    }

    // Sharing

    /// Returns the note's share token, creating one if the note has none or
    /// its recorded token no longer resolves to it.
    pub async fn create_share(&self, user_id: &str, note_id: &str) -> Result<String> {
        let note = self.store.read(user_id, note_id).await?;

        let stale = note.meta.share_id;
        if let Some(token) = &stale {
            match self.shares.resolve(token).await {
                Ok(entry) if entry.user_id == user_id && entry.note_id == note_id => {
                    return Ok(token.clone());
                }
                Ok(_) => warn!("Share {} points elsewhere, replacing it", token),
                Err(e) if e.is_not_found() => debug!("Replacing stale share {}", token),
                Err(e) => return Err(e),
            }
        }

        let token = self.shares.create(user_id, note_id).await?;
        let claimed = self
            .store
            .claim_share_id(user_id, note_id, &token, stale.as_deref())
            .await;
        match claimed {
            Ok(winner) if winner == token => Ok(token),
            Ok(winner) => {
                debug!("{}/{} was shared concurrently as {}", user_id, note_id, winner);
                self.shares.revoke(&token).await?;
                Ok(winner)
            }
            Err(e) => {
                self.shares.revoke(&token).await?;
                Err(e)
            }
        }
    }

    /// Removes the note's share link, both the registry entry and the
    /// note's `shareId`. A note without a link is left alone.
    pub async fn revoke_share(&self, user_id: &str, note_id: &str) -> Result<()> {
        let Some(token) = self.store.release_share_id(user_id, note_id).await? else {
            return Ok(());
        };

        self.shares.revoke(&token).await?;
        info!("Revoked share {} for {}/{}", token, user_id, note_id);
        Ok(())
    }

    /// What an anonymous visitor of a share link sees.
    pub async fn resolve_share(&self, token: &str, password: Option<&str>) -> Result<SharedNote> {
        let not_found = || NotesError::ShareNotFound {
            token: token.to_string(),
        };

        let entry = self.shares.resolve(token).await?;
        let note = match self.store.read(&entry.user_id, &entry.note_id).await {
            Ok(note) => note,
            Err(e) if e.is_not_found() => return Err(not_found()),
            Err(e) => return Err(e),
        };
        if note.meta.share_id.as_deref() != Some(token) {
            debug!("Share {} is no longer attached to its note", token);
            return Err(not_found());
        }

        if note.meta.password_protected {
            let password = password.filter(|p| !p.is_empty());
            let verified = match (password, note.meta.password_hash.as_deref()) {
                (None, _) => return Err(NotesError::PasswordRequired),
                (Some(password), Some(hash)) => self.verify_password(password, hash).await?,
                (Some(_), None) => false,
            };
            if !verified {
                return Err(NotesError::InvalidPassword);
            }
        }

        Ok(SharedNote {
            title: note.meta.title,
            content: note.content,
            tags: note.meta.tags,
            groups: note.meta.groups,
            updated_at: note.meta.updated_at,
        })
    }

    // Media

    /// Stores an upload for an existing note.
    pub async fn upload_media(
        &self,
        user_id: &str,
        note_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<MediaRef> {
        self.store.read(user_id, note_id).await?;
        self.store.save_media(user_id, note_id, file_name, bytes).await
    }

    pub async fn read_media(&self, user_id: &str, note_id: &str, file_name: &str) -> Result<Vec<u8>> {
        self.store.read_media(user_id, note_id, file_name).await
    }

    // Backup and maintenance

    pub async fn export_all(&self) -> Result<BackupDocument> {
        self.codec.export().await
    }

    pub async fn import_backup(&self, document: &BackupDocument) -> Result<ImportSummary> {
        self.codec.import(document).await
    }

    pub async fn export_archive(&self, path: &Path) -> Result<ArchiveSummary> {
        self.codec.export_archive(path).await
    }

    pub async fn import_archive(&self, path: &Path) -> Result<ImportSummary> {
        self.codec.import_archive(path).await
    }

    pub async fn create_full_backup(&self, backup_dir: &Path, max_backups: u32) -> Result<PathBuf> {
        self.codec.create_full_backup(backup_dir, max_backups).await
    }

    /// Rewrites the user's legacy notes in the current layout, then indexes
    /// any content files that have no index entry.
    pub async fn migrate_user(&self, user_id: &str) -> Result<MigrationSummary> {
        let migrated = self.store.migrate_legacy(user_id).await?;
        let adopted = self.store.adopt_orphans(user_id).await?;
        Ok(MigrationSummary { migrated, adopted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tempfile::TempDir;

    /// Reversible stand-in so tests avoid argon2's cost.
    struct PlainHashing;

    impl PasswordHashing for PlainHashing {
        fn hash(&self, password: &str) -> Result<String> {
            Ok(format!("plain${}", password))
        }

        fn verify(&self, password: &str, hash: &str) -> bool {
            hash.strip_prefix("plain$") == Some(password)
        }
    }

    /// Sleeps like a real key derivation would.
    struct SlowHashing;

    impl PasswordHashing for SlowHashing {
        fn hash(&self, password: &str) -> Result<String> {
            std::thread::sleep(Duration::from_millis(300));
            PlainHashing.hash(password)
        }

        fn verify(&self, password: &str, hash: &str) -> bool {
            std::thread::sleep(Duration::from_millis(300));
            PlainHashing.verify(password, hash)
        }
    }

    fn memory_stores() -> ServiceStores {
        ServiceStores {
            accounts: Arc::new(MemoryStore::new()),
            users: Arc::new(MemoryStore::new()),
            shares: Arc::new(MemoryStore::new()),
        }
    }

    fn service() -> (TempDir, NoteService) {
        let dir = TempDir::new().unwrap();
        let service =
            NoteService::with_parts(dir.path(), memory_stores(), Arc::new(PlainHashing), 150);
        (dir, service)
    }

    #[tokio::test]
    async fn password_hashing_does_not_stall_other_tasks() {
        let dir = TempDir::new().unwrap();
        let svc = NoteService::with_parts(dir.path(), memory_stores(), Arc::new(SlowHashing), 150);

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        svc.create_account("alice", "pw", false).await.unwrap();
        assert!(svc.verify_login("alice", "pw").await.unwrap());
        ticker.abort();

        // Roughly 600ms of hashing happened while the ticker ran.
        assert!(ticks.load(Ordering::SeqCst) >= 10);
    }

    #[tokio::test]
    async fn accounts_register_users_and_survive_deletion_as_data() {
        let (_dir, svc) = service();
        svc.create_account("alice", "pw", true).await.unwrap();
        assert!(svc.verify_login("alice", "pw").await.unwrap());
        assert!(!svc.verify_login("alice", "nope").await.unwrap());
        assert!(!svc.verify_login("ghost", "pw").await.unwrap());
        assert_eq!(svc.list_users().await.unwrap(), vec!["alice"]);

        let id = svc.create_note("alice", "Kept").await.unwrap();
        svc.delete_account("alice").await.unwrap();
        assert!(svc.list_accounts().await.unwrap().is_empty());
        assert_eq!(svc.read_note("alice", &id).await.unwrap().meta.title, "Kept");
        assert!(svc.delete_account("alice").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn empty_password_is_rejected_before_anything_is_stored() {
        let (_dir, svc) = service();
        assert!(matches!(
            svc.create_account("alice", "", false).await,
            Err(NotesError::Validation { .. })
        ));
        assert!(svc.list_users().await.unwrap().is_empty());

        let id = svc.create_note("alice", "Diary").await.unwrap();
        let request = SaveRequest {
            password: PasswordIntent::Set(String::new()),
            ..Default::default()
        };
        assert!(svc.save_note("alice", &id, request).await.is_err());
        assert!(!svc.read_note("alice", &id).await.unwrap().meta.password_protected);
    }

    #[tokio::test]
    async fn import_markdown_takes_title_from_heading() {
        let (_dir, svc) = service();
        let id = svc
            .import_markdown("alice", "", "# Recipes\n\nflour")
            .await
            .unwrap();
        let note = svc.read_note("alice", &id).await.unwrap();
        assert_eq!(note.meta.title, "Recipes");
        assert_eq!(note.content, "# Recipes\n\nflour");
    }

    #[tokio::test]
    async fn share_is_idempotent_and_revocable() {
        let (_dir, svc) = service();
        let id = svc.create_note("alice", "Public").await.unwrap();
        svc.save_note("alice", &id, SaveRequest::content("hello"))
            .await
            .unwrap();

        let token = svc.create_share("alice", &id).await.unwrap();
        assert_eq!(svc.create_share("alice", &id).await.unwrap(), token);
        assert_eq!(svc.resolve_share(&token, None).await.unwrap().content, "hello");

        svc.revoke_share("alice", &id).await.unwrap();
        assert!(svc.read_note("alice", &id).await.unwrap().meta.share_id.is_none());
        assert!(svc.resolve_share(&token, None).await.unwrap_err().is_not_found());
        svc.revoke_share("alice", &id).await.unwrap();
    }

    #[tokio::test]
    async fn stale_share_id_is_replaced() {
        let (_dir, svc) = service();
        let id = svc.create_note("alice", "Public").await.unwrap();
        let token = svc.create_share("alice", &id).await.unwrap();
        svc.shares.revoke(&token).await.unwrap();

        let fresh = svc.create_share("alice", &id).await.unwrap();
        assert_ne!(fresh, token);
        assert!(svc.resolve_share(&fresh, None).await.is_ok());
    }

    #[tokio::test]
    async fn share_entry_for_another_token_is_not_found() {
        let (_dir, svc) = service();
        let id = svc.create_note("alice", "Public").await.unwrap();
        svc.create_share("alice", &id).await.unwrap();

        let dangling = svc.shares.create("alice", &id).await.unwrap();
        assert!(matches!(
            svc.resolve_share(&dangling, None).await,
            Err(NotesError::ShareNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn deleting_a_note_revokes_its_share() {
        let (_dir, svc) = service();
        let id = svc.create_note("alice", "Gone").await.unwrap();
        let token = svc.create_share("alice", &id).await.unwrap();

        svc.delete_note("alice", &id).await.unwrap();
        svc.delete_note("alice", &id).await.unwrap();
        assert!(svc.shares.resolve(&token).await.is_err());
        assert!(svc.read_note("alice", &id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn media_requires_an_existing_note() {
        let (_dir, svc) = service();
        assert!(svc
            .upload_media("alice", "missing", "a.png", vec![1])
            .await
            .unwrap_err()
            .is_not_found());

        let id = svc.create_note("alice", "Pics").await.unwrap();
        let media = svc
            .upload_media("alice", &id, "a b.png", vec![1, 2])
            .await
            .unwrap();
        assert!(media.file_name.ends_with("-a_b.png"));
        assert_eq!(
            media.url_path,
            format!("/media/alice/{}/{}", id, media.file_name)
        );
        assert_eq!(
            svc.read_media("alice", &id, &media.file_name).await.unwrap(),
            vec![1, 2]
        );
    }
}
