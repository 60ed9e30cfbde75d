use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{InstanceConfig, StatusProtocol};
use crate::error::{AppError, Result};

/// Instance ids double as directory and file names.
pub fn validate_instance_id(instance_id: &str) -> Result<()> {
    let is_safe = !instance_id.is_empty()
        && instance_id.len() <= 64
        && instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));

    if !is_safe {
        return Err(AppError::config(format!(
            "Invalid instance id {instance_id:?}"
        )));
    }
    Ok(())
}

pub fn validate_instance_config(instance_id: &str, config: &InstanceConfig) -> Result<()> {
    validate_instance_id(instance_id)?;
    if config.command.trim().is_empty() {
        return Err(AppError::config(format!(
            "Instance {instance_id} has an empty launch command"
        )));
    }
    if config.port == 0 {
        return Err(AppError::config(format!(
            "Instance {instance_id} has no port configured"
        )));
    }
    if config.sleep.enabled && config.sleep.idle_minutes == 0 {
        return Err(AppError::config(format!(
            "Instance {instance_id} has sleep enabled with idle_minutes = 0"
        )));
    }
    if config.sleep.enabled && config.protocol == StatusProtocol::None {
        return Err(AppError::config(format!(
            "Instance {instance_id} needs a status protocol to sleep"
        )));
    }
    Ok(())
}

/// Backup ids are uuids generated by the job pipeline.
pub fn validate_backup_id(backup_id: &str) -> Result<()> {
    if uuid::Uuid::parse_str(backup_id).is_err() {
        return Err(AppError::backup("Invalid backup id"));
    }
    Ok(())
}

/// Resolve `file_name` inside `backups_dir`, refusing anything that escapes it.
pub fn resolve_backup_path(
    backups_dir: &Path,
    file_name: &str,
    require_exists: bool,
) -> Result<PathBuf> {
    let backups_dir_canonical = ensure_and_canonicalize_dir(backups_dir, "backups")?;

    let file_name = Path::new(file_name)
        .file_name()
        .ok_or_else(|| AppError::backup("Invalid backup path"))?;

    let candidate = backups_dir.join(file_name);

    if !candidate.exists() {
        if require_exists {
            return Err(AppError::backup(format!(
                "Backup archive {} not found",
                candidate.display()
            )));
        }
        return Ok(candidate);
    }

    let canonical_candidate = candidate
        .canonicalize()
        .map_err(|e| AppError::backup(format!("Failed to resolve backup path: {}", e)))?;

    if !canonical_candidate.starts_with(&backups_dir_canonical) {
        return Err(AppError::backup("Backup path is outside backups directory"));
    }

    Ok(canonical_candidate)
}

fn ensure_and_canonicalize_dir(path: &Path, label: &str) -> Result<PathBuf> {
    fs::create_dir_all(path)
        .map_err(|e| AppError::io(format!("Failed to create {} dir: {}", label, e)))?;
    path.canonicalize()
        .map_err(|e| AppError::io(format!("Failed to resolve {} dir: {}", label, e)))
}
