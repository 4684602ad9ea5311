use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{read_optional, parse_json, write_json_atomic, NotesError, Result, DEFAULT_PREVIEW_LENGTH};

/// Application configuration settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Root of all stored data: registries, shares and per-user directories
    pub data_dir: PathBuf,

    /// Directory for backup archives
    pub backup_dir: PathBuf,

    /// How often to create backups (in hours)
    pub backup_frequency: u32,

    /// Maximum number of backups to keep (0 keeps all)
    pub max_backups: u32,

    /// Whether the scheduler creates backups on its own
    pub auto_backup: bool,

    /// Characters of plain text in search previews
    pub preview_length: usize,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "mdnotes", "mdnotes")
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("mdnotes-data"));
        Config {
            backup_dir: data_dir.join("backups"),
            data_dir,
            backup_frequency: 24,
            max_backups: 7,
            auto_backup: false,
            preview_length: DEFAULT_PREVIEW_LENGTH,
        }
    }
}

impl Config {
    /// Where the configuration file lives when no path is given.
    pub fn default_path() -> PathBuf {
        project_dirs()
            .map(|dirs| dirs.config_dir().join("config.json"))
            .unwrap_or_else(|| PathBuf::from("mdnotes-config.json"))
    }

    /// Reads the configuration file, or returns defaults if there is none.
    pub async fn load(path: &Path) -> Result<Config> {
        match read_optional(path).await? {
            Some(bytes) => {
                debug!("Loading configuration from {}", path.display());
                parse_json(path, &bytes).map_err(|e| NotesError::ConfigError {
                    message: e.to_string(),
                })
            }
            None => {
                debug!("No configuration at {}, using defaults", path.display());
                Ok(Config::default())
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self).await?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Updates one setting from a `key=value` pair.
    pub fn set(&mut self, assignment: &str) -> Result<()> {
        let (key, value) = assignment
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .ok_or_else(|| NotesError::ConfigError {
                message: format!("expected key=value, got {:?}", assignment),
            })?;

        let invalid = |e: &dyn std::fmt::Display| NotesError::ConfigError {
            message: format!("invalid value for {}: {}", key, e),
        };
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "backup_dir" => self.backup_dir = PathBuf::from(value),
            "backup_frequency" => self.backup_frequency = value.parse().map_err(|e| invalid(&e))?,
            "max_backups" => self.max_backups = value.parse().map_err(|e| invalid(&e))?,
            "auto_backup" => self.auto_backup = value.parse().map_err(|e| invalid(&e))?,
            "preview_length" => self.preview_length = value.parse().map_err(|e| invalid(&e))?,
            _ => {
                return Err(NotesError::ConfigError {
                    message: format!("unknown setting {:?}", key),
                })
            }
        }
        Ok(())
    }

    pub fn users_dir(&self) -> PathBuf {
        self.data_dir.join("users")
    }

    pub fn accounts_path(&self) -> PathBuf {
        self.data_dir.join("accounts.json")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }

    pub fn shares_dir(&self) -> PathBuf {
        self.data_dir.join("shares")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_means_defaults_and_save_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        assert_eq!(Config::load(&path).await.unwrap(), Config::default());

        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.set("max_backups = 3").unwrap();
        config.save(&path).await.unwrap();

        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded.max_backups, 3);
        assert_eq!(loaded.users_dir(), dir.path().join("data/users"));
    }

    #[tokio::test]
    async fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"preview_length": 40}"#).unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.preview_length, 40);
        assert_eq!(config.max_backups, Config::default().max_backups);
    }

    #[test]
    fn bad_assignments_are_config_errors() {
        let mut config = Config::default();
        for bad in ["max_backups", "max_backups=many", "colour=blue"] {
            assert!(matches!(
                config.set(bad),
                Err(NotesError::ConfigError { .. })
            ));
        }
        config.set("auto_backup=true").unwrap();
        assert!(config.auto_backup);
    }
}
