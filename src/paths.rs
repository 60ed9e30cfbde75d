//! Centralized path layout for the host data directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Environment variable overriding the data root.
pub const DATA_DIR_ENV: &str = "GAMEHOST_HOME";

/// Get the default root data directory (`$GAMEHOST_HOME` or `~/.gamehost`).
pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or_else(|| AppError::config("Cannot find home directory"))?;
    Ok(home.join(".gamehost"))
}

/// Layout of everything the host persists under one root.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the config file.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Path to the scheduled task list.
    pub fn tasks_path(&self) -> PathBuf {
        self.root.join("tasks.json")
    }

    /// Default data directory for an instance without an explicit one.
    pub fn default_instance_dir(&self, instance_id: &str) -> PathBuf {
        self.root.join("instances").join(instance_id)
    }

    /// Backups directory for one instance.
    pub fn backups_dir(&self, instance_id: &str) -> PathBuf {
        self.root.join("backups").join(instance_id)
    }

    /// Directory holding pid files of supervised processes.
    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn pid_file(&self, instance_id: &str) -> PathBuf {
        self.run_dir().join(format!("{instance_id}.pid"))
    }

    /// Ensure all required data directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        let dirs = [
            self.root.clone(),
            self.root.join("instances"),
            self.root.join("backups"),
            self.run_dir(),
        ];
        for dir in &dirs {
            fs::create_dir_all(dir)
                .map_err(|e| AppError::io(format!("Failed to create {}: {}", dir.display(), e)))?;
        }
        Ok(())
    }
}
