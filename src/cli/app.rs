//! CLI module for the mdnotes application
//!
//! Turns parsed [`Commands`] into [`NoteService`] calls and prints the results.
use std::{
    future::Future,
    io::{stdin, stdout, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, error, info, warn};

use crate::{
    parse_json, parse_tags, write_json_atomic, BackupDocument, BackupScheduler,
    BackupSchedulerStatus, Commands, Config, ImportSummary, NoteMeta, NoteService, NotesError,
    PasswordIntent, Result, SaveRequest,
};

/// CLI Application handler - processes CLI commands against the note service
pub struct App {
    service: Arc<NoteService>,

    /// Application configuration
    config: Config,

    /// Where `config` is read from and saved to
    config_path: PathBuf,

    /// Whether to display verbose output
    verbose: bool,
}

fn separator() -> String {
    let term_width = terminal_size::terminal_size()
        .map(|(w, _)| w.0 as usize)
        .unwrap_or(80);
    "-".repeat(term_width.min(50))
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

fn is_archive(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "zip")
}

impl App {
    pub fn new(service: Arc<NoteService>, config: Config, config_path: PathBuf, verbose: bool) -> Self {
        Self {
            service,
            config,
            config_path,
            verbose,
        }
    }

    /// Run the CLI application with the given command
    pub async fn run(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::Users { json } => self.list_users(json).await?,

            Commands::CreateUser {
                username,
                password,
                admin,
            } => {
                let account = self.service.create_account(&username, &password, admin).await?;
                println!(
                    "Account {} created{}",
                    console::style(&account.username).bold(),
                    if account.is_admin { " (admin)" } else { "" }
                );
            }

            Commands::DeleteUser { username } => {
                self.service.delete_account(&username).await?;
                println!("Account {} deleted. Its notes were kept.", username);
            }

            Commands::List {
                user,
                tag,
                limit,
                json,
                brief,
            } => self.list_notes(&user, tag, limit, json, brief).await?,

            Commands::View { user, id, json } => self.view_note(&user, &id, json).await?,

            Commands::Create {
                user,
                title,
                content,
                file,
                tags,
                groups,
                password,
            } => {
                self.create_note(&user, title, content, file, tags, groups, password)
                    .await?
            }

            Commands::Search {
                user,
                query,
                limit,
                json,
            } => self.search(&user, &query, limit, json).await?,

            Commands::Delete { user, id, force } => self.handle_delete(&user, &id, force).await?,

            Commands::Share { user, id, revoke } => {
                if revoke {
                    self.service.revoke_share(&user, &id).await?;
                    println!("Share link for {} revoked", id);
                } else {
                    let token = self.service.create_share(&user, &id).await?;
                    println!("Share token: {}", console::style(token).green());
                }
            }

            Commands::Resolve { token, password } => {
                let shared = self.service.resolve_share(&token, password.as_deref()).await?;
                println!("{}", console::style(&shared.title).bold());
                println!("Updated: {}", shared.updated_at.format("%Y-%m-%d %H:%M"));
                println!("{}", separator());
                println!("{}", shared.content);
            }

            Commands::Export { output } => self.export(&output).await?,

            Commands::Import { source } => self.import(&source).await?,

            Commands::Migrate { user } => {
                let failed = self.migrate(user).await?;
                if !failed.is_empty() {
                    println!("{} user{} could not be migrated", failed.len(), plural(failed.len()));
                }
            }

            Commands::Backup { output } => {
                let path = match output {
                    Some(path) => self.service.export_archive(&path).await?.path,
                    None => {
                        self.service
                            .create_full_backup(&self.config.backup_dir, self.config.max_backups)
                            .await?
                    }
                };
                println!("Backup written to {}", path.display());
            }

            Commands::Daemon { backup_now } => {
                let shutdown = async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Cannot listen for Ctrl-C: {}", e);
                    }
                };
                let status = self.run_daemon(backup_now, shutdown).await?;
                if let Some(path) = status.last_backup_path {
                    println!("Last backup: {}", path.display());
                }
            }

            Commands::Config { show, set, reset } => self.handle_config(show, set, reset).await?,
        }

        Ok(())
    }

    async fn list_users(&self, json: bool) -> Result<()> {
        let users = self.service.list_users().await?;
        let accounts = self.service.list_accounts().await?;

        if json {
            let rows: Vec<serde_json::Value> = users
                .iter()
                .map(|user| {
                    let account = accounts.iter().find(|a| &a.username == user);
                    serde_json::json!({
                        "userId": user,
                        "hasAccount": account.is_some(),
                        "isAdmin": account.is_some_and(|a| a.is_admin),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(());
        }

        for user in &users {
            let marker = match accounts.iter().find(|a| &a.username == user) {
                Some(account) if account.is_admin => console::style("admin").yellow().to_string(),
                Some(_) => String::new(),
                None => console::style("no account").dim().to_string(),
            };
            println!("{} {}", user, marker);
        }
        println!("\n{} user{}", users.len(), plural(users.len()));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_note(
        &self,
        user: &str,
        title: String,
        content: Option<String>,
        file: Option<PathBuf>,
        tags: Option<String>,
        groups: Option<String>,
        password: Option<String>,
    ) -> Result<()> {
        let note_content = match (content, file) {
            (Some(c), _) => c,
            (None, Some(file_path)) => tokio::fs::read_to_string(&file_path).await?,
            (None, None) => String::new(),
        };

        let id = self.service.import_markdown(user, &title, &note_content).await?;

        let request = SaveRequest {
            tags: tags.map(|t| parse_tags(Some(t))),
            groups: groups.map(|g| parse_tags(Some(g))),
            password: password.map_or(PasswordIntent::Keep, PasswordIntent::Set),
            ..Default::default()
        };
        if request != SaveRequest::default() {
            self.service.save_note(user, &id, request).await?;
        }

        println!("Note created with ID: {}", id);
        Ok(())
    }

    async fn list_notes(
        &self,
        user: &str,
        tag: Option<String>,
        limit: usize,
        json: bool,
        brief: bool,
    ) -> Result<()> {
        let mut notes = self.service.list_notes(user).await?;
        if let Some(tag) = tag {
            notes.retain(|meta| meta.tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)));
        }
        notes.truncate(limit);

        if notes.is_empty() {
            println!("No notes found matching the criteria.");
            return Ok(());
        }

        if json {
            println!("{}", serde_json::to_string_pretty(&notes)?);
            return Ok(());
        }

        for (i, meta) in notes.iter().enumerate() {
            if brief {
                println!("{}  {}", meta.id, meta.title);
                continue;
            }
            if i > 0 {
                println!("{}", separator());
            }
            self.print_meta(meta);
        }

        println!("\nFound {} note{}", notes.len(), plural(notes.len()));
        Ok(())
    }

    fn print_meta(&self, meta: &NoteMeta) {
        println!(
            "ID: {} | Updated: {}",
            meta.id,
            meta.updated_at.format("%Y-%m-%d %H:%M")
        );
        println!("Title: {}", console::style(&meta.title).bold());

        if !meta.tags.is_empty() {
            let tags = meta
                .tags
                .iter()
                .map(|tag| format!("#{}", tag))
                .collect::<Vec<_>>()
                .join(" ");
            println!("Tags: {}", console::style(tags).cyan());
        }
        if !meta.groups.is_empty() {
            println!("Groups: {}", meta.groups.join(", "));
        }
        if meta.password_protected {
            println!("{}", console::style("password protected").yellow());
        }
        if self.verbose {
            if let Some(token) = &meta.share_id {
                println!("Shared: {}", token);
            }
            println!("Created: {}", meta.created_at.format("%Y-%m-%d %H:%M:%S"));
        }
    }

    async fn view_note(&self, user: &str, id: &str, json: bool) -> Result<()> {
        let note = self.service.read_note(user, id).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&note)?);
            return Ok(());
        }
        self.print_meta(&note.meta);
        println!("{}", separator());
        println!("{}", note.content);
        Ok(())
    }

    async fn search(&self, user: &str, query: &str, limit: usize, json: bool) -> Result<()> {
        let mut results = self.service.search_notes(user, query).await?;
        results.truncate(limit);

        if json {
            println!("{}", serde_json::to_string_pretty(&results)?);
            return Ok(());
        }
        if results.is_empty() {
            println!("No notes match {:?}", query);
            return Ok(());
        }

        for result in &results {
            println!("{}  {}", console::style(&result.id).dim(), console::style(&result.name).bold());
            if !result.preview.is_empty() {
                println!("    {}", result.preview);
            }
        }
        println!("\nFound {} note{}", results.len(), plural(results.len()));
        Ok(())
    }

    async fn handle_delete(&self, user: &str, id: &str, force: bool) -> Result<()> {
        let note = self.service.read_note(user, id).await?;

        if !force {
            println!("You are about to delete the following note:");
            println!("ID:     {}", note.meta.id);
            println!("Title:  {}", note.meta.title);
            println!("Tags:   {}", note.meta.tags.join(", "));
            println!("Created: {}", note.meta.created_at.format("%Y-%m-%d %H:%M:%S"));

            println!("\nThis action cannot be undone!");
            print!("Are you sure you want to delete this note? [y/N]: ");
            stdout().flush()?;

            let mut input = String::new();
            stdin().read_line(&mut input)?;

            let input = input.trim().to_lowercase();
            if input != "y" && input != "yes" {
                println!("Deletion cancelled.");
                return Ok(());
            }
        }

        self.service.delete_note(user, id).await?;
        println!(
            "Note '{}' ({}) has been permanently deleted.",
            note.meta.title, note.meta.id
        );
        Ok(())
    }

    async fn export(&self, output: &Path) -> Result<()> {
        if is_archive(output) {
            let summary = self.service.export_archive(output).await?;
            println!(
                "Exported {} notes of {} users and {} media files to {}",
                summary.notes,
                summary.users,
                summary.media_files,
                output.display()
            );
        } else {
            let document = self.service.export_all().await?;
            write_json_atomic(output, &document).await?;
            println!(
                "Exported {} notes of {} users to {}",
                document.note_count(),
                document.users.len(),
                output.display()
            );
        }
        Ok(())
    }

    async fn import(&self, source: &Path) -> Result<()> {
        let summary = if is_archive(source) {
            self.service.import_archive(source).await?
        } else {
            let bytes = tokio::fs::read(source).await?;
            let document: BackupDocument = parse_json(source, &bytes)?;
            self.service.import_backup(&document).await?
        };
        self.print_import_summary(&summary);
        Ok(())
    }

    fn print_import_summary(&self, summary: &ImportSummary) {
        println!(
            "Imported {} note{} ({} already present)",
            summary.notes_imported,
            plural(summary.notes_imported),
            summary.notes_skipped
        );
        println!(
            "Accounts: {} added, {} kept | Users registered: {} | Media files: {}",
            summary.accounts_imported,
            summary.accounts_skipped,
            summary.users_registered,
            summary.media_written
        );
        for (user, message) in &summary.failed_users {
            println!("{} {}: {}", console::style("failed").red(), user, message);
        }
    }

    /// Migrates one user, or every registered user. With no user given, a
    /// failing user is reported and skipped; the failures are returned.
    async fn migrate(&self, user: Option<String>) -> Result<Vec<String>> {
        let (users, single) = match user {
            Some(user) => (vec![user], true),
            None => (self.service.list_users().await?, false),
        };

        let mut failed = Vec::new();
        for user in users {
            let summary = match self.service.migrate_user(&user).await {
                Ok(summary) => summary,
                Err(e) if single => return Err(e),
                Err(e) => {
                    warn!("Migration failed for {}: {}", user, e);
                    println!("{} {}: {}", console::style("failed").red(), user, e);
                    failed.push(user);
                    continue;
                }
            };
            println!(
                "{}: {} legacy note{} migrated, {} orphan{} indexed",
                user,
                summary.migrated,
                plural(summary.migrated),
                summary.adopted,
                plural(summary.adopted)
            );
        }
        Ok(failed)
    }

    /// Runs the backup scheduler until `shutdown` completes and returns its
    /// final status.
    pub async fn run_daemon<F>(&self, backup_now: bool, shutdown: F) -> Result<BackupSchedulerStatus>
    where
        F: Future<Output = ()>,
    {
        if !self.config.auto_backup {
            return Err(NotesError::ConfigError {
                message: "auto_backup is disabled; enable it with `config --set auto_backup=true`"
                    .to_string(),
            });
        }

        let mut scheduler = BackupScheduler::new(self.config.clone(), Arc::clone(&self.service));
        scheduler.start().await?;
        println!(
            "Backing up every {}h into {}. Press Ctrl-C to stop.",
            self.config.backup_frequency.max(1),
            self.config.backup_dir.display()
        );

        if backup_now {
            match scheduler.create_backup_now().await {
                Ok(path) => println!("Backup written to {}", path.display()),
                Err(e) => {
                    scheduler.stop().await?;
                    return Err(e);
                }
            }
        }

        shutdown.await;
        let status = scheduler.get_status().await;
        scheduler.stop().await?;
        Ok(status)
    }

    async fn handle_config(&mut self, show: bool, set: Option<String>, reset: bool) -> Result<()> {
        let changed = reset || set.is_some();
        if reset {
            self.config = Config::default();
            info!("Configuration reset to defaults");
        }
        if let Some(assignment) = set {
            self.config.set(&assignment)?;
            debug!("Applied {}", assignment);
        }
        if changed {
            self.config.save(&self.config_path).await?;
        }

        if show || !changed {
            println!("Configuration file: {}", self.config_path.display());
            println!("{}", serde_json::to_string_pretty(&self.config)?);
        }
        Ok(())
    }
}
