// src/backup_scheduler.rs - Periodic backup archives
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::{Config, NoteService, NotesError, Result};

#[derive(Debug, Clone, Default)]
pub struct BackupSchedulerStatus {
    /// Whether the scheduler is running
    pub is_running: bool,
    /// The time the last backup was created
    pub last_backup_time: Option<DateTime<Utc>>,
    /// The path to the last backup file
    pub last_backup_path: Option<PathBuf>,
}

#[derive(Debug)]
pub enum BackupCommand {
    /// Create a full backup immediately and report where it went
    CreateBackupNow(oneshot::Sender<Result<PathBuf>>),
    /// Stop the backup scheduler
    Stop,
}

pub struct BackupScheduler {
    config: Config,
    service: Arc<NoteService>,

    /// Channel to send commands to the scheduler task
    command_tx: Option<mpsc::Sender<BackupCommand>>,

    scheduler_task: Option<JoinHandle<()>>,

    /// Shared with the scheduler task, which records each backup
    status: Arc<Mutex<BackupSchedulerStatus>>,
}

async fn run_backup(
    service: &NoteService,
    config: &Config,
    status: &Mutex<BackupSchedulerStatus>,
) -> Result<PathBuf> {
    let path = service
        .create_full_backup(&config.backup_dir, config.max_backups)
        .await?;
    let mut status = status.lock().await;
    status.last_backup_time = Some(Utc::now());
    status.last_backup_path = Some(path.clone());
    Ok(path)
}

impl BackupScheduler {
    pub fn new(config: Config, service: Arc<NoteService>) -> Self {
        debug!(
            "Initializing backup scheduler: every {}h into {}",
            config.backup_frequency,
            config.backup_dir.display()
        );
        Self {
            config,
            service,
            command_tx: None,
            scheduler_task: None,
            status: Arc::new(Mutex::new(BackupSchedulerStatus::default())),
        }
    }

    /// Starts the scheduler task. Does nothing if auto backup is disabled or
    /// the scheduler already runs.
    pub async fn start(&mut self) -> Result<()> {
        if !self.config.auto_backup {
            debug!("Auto backup disabled, scheduler not started");
            return Ok(());
        }
        if self.scheduler_task.is_some() {
            return Ok(());
        }
        info!("Starting backup scheduler...");

        let (command_tx, mut command_rx) = mpsc::channel(10);
        self.command_tx = Some(command_tx);

        let backup_frequency_secs = u64::from(self.config.backup_frequency.max(1)) * 3600;
        let service = Arc::clone(&self.service);
        let config = self.config.clone();
        let status = Arc::clone(&self.status);

        let task = tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(backup_frequency_secs));
            interval.tick().await; // Initial tick

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match run_backup(&service, &config, &status).await {
                            Ok(path) => info!("Scheduled backup completed at {}", path.display()),
                            Err(e) => error!("Scheduled backup failed: {}", e),
                        }
                    }
                    cmd = command_rx.recv() => match cmd {
                        Some(BackupCommand::CreateBackupNow(reply)) => {
                            let result = run_backup(&service, &config, &status).await;
                            match &result {
                                Ok(path) => info!("Manual backup completed at {}", path.display()),
                                Err(e) => error!("Manual backup failed: {}", e),
                            }
                            let _ = reply.send(result);
                        }
                        Some(BackupCommand::Stop) | None => {
                            info!("Backup scheduler stopping...");
                            break;
                        }
                    }
                }
            }
        });

        self.scheduler_task = Some(task);
        self.status.lock().await.is_running = true;
        Ok(())
    }

    /// Stop the backup scheduler if it's running
    pub async fn stop(&mut self) -> Result<()> {
        let Some(task) = self.scheduler_task.take() else {
            debug!("Backup scheduler is not running");
            return Ok(());
        };

        if let Some(tx) = self.command_tx.take() {
            if let Err(e) = tx.send(BackupCommand::Stop).await {
                error!("Failed to send stop command to backup scheduler: {}", e);
            }
        }

        let joined = task.await;
        self.status.lock().await.is_running = false;
        if let Err(e) = joined {
            let message = format!("Failed to stop backup scheduler: {}", e);
            error!("{}", message);
            return Err(NotesError::BackupFailed { message });
        }

        info!("Backup scheduler stopped");
        Ok(())
    }

    /// Create a backup immediately, regardless of the schedule
    pub async fn create_backup_now(&self) -> Result<PathBuf> {
        let not_running = || NotesError::BackupFailed {
            message: "Backup scheduler is not running".to_string(),
        };
        let tx = self.command_tx.as_ref().ok_or_else(not_running)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(BackupCommand::CreateBackupNow(reply_tx))
            .await
            .map_err(|e| NotesError::BackupFailed {
                message: format!("Failed to send backup command: {}", e),
            })?;
        reply_rx.await.map_err(|_| not_running())?
    }

    pub async fn get_status(&self) -> BackupSchedulerStatus {
        self.status.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Argon2Hashing, MemoryStore, ServiceStores};
    use tempfile::TempDir;

    fn scheduler(dir: &TempDir, auto_backup: bool) -> BackupScheduler {
        let config = Config {
            data_dir: dir.path().join("data"),
            backup_dir: dir.path().join("backups"),
            auto_backup,
            ..Config::default()
        };
        let stores = ServiceStores {
            accounts: Arc::new(MemoryStore::new()),
            users: Arc::new(MemoryStore::new()),
            shares: Arc::new(MemoryStore::new()),
        };
        let service = NoteService::with_parts(
            config.users_dir(),
            stores,
            Arc::new(Argon2Hashing::new()),
            config.preview_length,
        );
        BackupScheduler::new(config, Arc::new(service))
    }

    #[tokio::test]
    async fn manual_backup_through_running_scheduler() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = scheduler(&dir, true);
        scheduler.start().await.unwrap();
        assert!(scheduler.get_status().await.is_running);

        let path = scheduler.create_backup_now().await.unwrap();
        assert!(path.exists());
        assert_eq!(scheduler.get_status().await.last_backup_path, Some(path));

        scheduler.stop().await.unwrap();
        assert!(!scheduler.get_status().await.is_running);
        assert!(scheduler.create_backup_now().await.is_err());
    }

    #[tokio::test]
    async fn disabled_scheduler_never_starts() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = scheduler(&dir, false);
        scheduler.start().await.unwrap();
        assert!(!scheduler.get_status().await.is_running);
        assert!(scheduler.create_backup_now().await.is_err());
        scheduler.stop().await.unwrap();
    }
}
