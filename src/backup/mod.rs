//! Backup archives of instance data directories.
//!
//! Each archive lives at `backups/<instance>/<id>.<ext>` next to a `<id>.toml`
//! sidecar holding its metadata, so listing never has to open an archive.

mod jobs;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::{
    extract_tar_gz_mapped, extract_zip_mapped, map_prefixed_entry, scan_tree, write_tar_gz,
    write_zip, ArchiveFormat, Progress,
};
use crate::error::{AppError, Result};
use crate::paths::DataPaths;
use crate::validation::{resolve_backup_path, validate_backup_id};

pub use jobs::{BackupJob, JobKind, JobPipeline, JobStatus, RestoreOptions, RestoreStep};

/// Archive prefix under which the data directory is stored.
const DATA_PREFIX: &str = "data";

/// Sidecar stored next to each archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub instance_id: String,
    #[serde(default)]
    pub instance_name: String,
    pub format: ArchiveFormat,
    pub size: u64,
    pub file_count: u64,
    pub created_at: DateTime<Utc>,
    /// Snapshot taken automatically before a restore.
    #[serde(default)]
    pub auto_generated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    #[serde(flatten)]
    pub metadata: BackupMetadata,
}

/// Filesystem side of backups: writing, listing, deleting and restoring archives.
#[derive(Debug, Clone)]
pub struct BackupStore {
    paths: DataPaths,
}

fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove partial backup {:?}: {}", path, e);
        }
    }
}

fn sidecar_path(backups_dir: &Path, backup_id: &str) -> PathBuf {
    backups_dir.join(format!("{backup_id}.toml"))
}

fn read_sidecar(path: &Path) -> Result<BackupMetadata> {
    let content = fs::read_to_string(path)
        .map_err(|e| AppError::backup(format!("Failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| AppError::backup(format!("Failed to parse metadata: {}", e)))
}

impl BackupStore {
    pub fn new(paths: DataPaths) -> Self {
        Self { paths }
    }

    /// Backups of one instance, newest first.
    ///
    /// Pre-restore snapshots are only included when `include_auto` is set.
    pub fn list(&self, instance_id: &str, include_auto: bool) -> Result<Vec<BackupInfo>> {
        let backups_dir = self.paths.backups_dir(instance_id);
        if !backups_dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(&backups_dir)
            .map_err(|e| AppError::backup(format!("Failed to read backups dir: {}", e)))?
        {
            let path = entry.map_err(|e| AppError::backup(e.to_string()))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
                continue;
            }
            let metadata = match read_sidecar(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    log::warn!("Skipping backup sidecar {:?}: {}", path, e);
                    continue;
                }
            };
            if metadata.auto_generated && !include_auto {
                continue;
            }
            let archive = backups_dir.join(format!("{}.{}", metadata.id, metadata.format.extension()));
            if !archive.is_file() {
                log::warn!("Backup {} has no archive at {:?}", metadata.id, archive);
                continue;
            }
            backups.push(BackupInfo {
                path: archive,
                metadata,
            });
        }

        backups.sort_by(|a, b| b.metadata.created_at.cmp(&a.metadata.created_at));
        Ok(backups)
    }

    pub fn get(&self, instance_id: &str, backup_id: &str) -> Result<BackupInfo> {
        validate_backup_id(backup_id)?;
        let backups_dir = self.paths.backups_dir(instance_id);
        let sidecar = resolve_backup_path(&backups_dir, &format!("{backup_id}.toml"), true)?;
        let metadata = read_sidecar(&sidecar)?;
        let file_name = format!("{}.{}", metadata.id, metadata.format.extension());
        let path = resolve_backup_path(&backups_dir, &file_name, true)?;
        Ok(BackupInfo { path, metadata })
    }

    /// Location of the archive file, for downloads.
    pub fn archive_path(&self, instance_id: &str, backup_id: &str) -> Result<PathBuf> {
        Ok(self.get(instance_id, backup_id)?.path)
    }

    pub fn delete(&self, instance_id: &str, backup_id: &str) -> Result<()> {
        let backup = self.get(instance_id, backup_id)?;
        fs::remove_file(&backup.path)
            .map_err(|e| AppError::backup(format!("Failed to delete backup: {}", e)))?;
        let sidecar = sidecar_path(&self.paths.backups_dir(instance_id), backup_id);
        fs::remove_file(&sidecar)
            .map_err(|e| AppError::backup(format!("Failed to delete backup metadata: {}", e)))?;
        log::info!("Deleted backup {} of instance {}", backup_id, instance_id);
        Ok(())
    }

    /// Delete the oldest manual backups beyond `keep`. Returns the deleted ids.
    pub fn prune(&self, instance_id: &str, keep: usize) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for backup in self.list(instance_id, false)?.into_iter().skip(keep) {
            self.delete(instance_id, &backup.metadata.id)?;
            deleted.push(backup.metadata.id);
        }
        Ok(deleted)
    }

    /// Archive `data_dir`. Blocking; partial output is removed on failure.
    pub(crate) fn create_archive(
        &self,
        instance_id: &str,
        instance_name: &str,
        data_dir: &Path,
        format: ArchiveFormat,
        auto_generated: bool,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<BackupInfo> {
        if !data_dir.is_dir() {
            return Err(AppError::backup(format!(
                "No data directory to back up at {}",
                data_dir.display()
            )));
        }
        let backups_dir = self.paths.backups_dir(instance_id);
        fs::create_dir_all(&backups_dir)
            .map_err(|e| AppError::backup(format!("Failed to create backups dir: {}", e)))?;

        let id = uuid::Uuid::new_v4().to_string();
        let archive_path = backups_dir.join(format!("{id}.{}", format.extension()));
        let stats = scan_tree(data_dir)?;

        let mut progress = Progress::new(stats.units(), on_progress);
        let written = match format {
            ArchiveFormat::Zip => write_zip(data_dir, &archive_path, DATA_PREFIX, &mut progress),
            ArchiveFormat::TarGz => {
                write_tar_gz(data_dir, &archive_path, DATA_PREFIX, &mut progress)
            }
        };
        if let Err(e) = written {
            remove_partial(&archive_path);
            return Err(AppError::backup(format!("Failed to write backup archive: {}", e)));
        }
        progress.finish();

        let metadata = BackupMetadata {
            id: id.clone(),
            instance_id: instance_id.to_string(),
            instance_name: instance_name.to_string(),
            format,
            size: fs::metadata(&archive_path)?.len(),
            file_count: stats.files,
            created_at: Utc::now(),
            auto_generated,
        };
        let sidecar = toml::to_string_pretty(&metadata)
            .map_err(|e| AppError::backup(format!("Failed to serialize metadata: {}", e)))
            .and_then(|content| {
                fs::write(sidecar_path(&backups_dir, &id), content)
                    .map_err(|e| AppError::backup(format!("Failed to write metadata: {}", e)))
            });
        if let Err(e) = sidecar {
            remove_partial(&archive_path);
            return Err(e);
        }

        log::info!(
            "Created {} backup {} of instance {} ({} files, {} bytes)",
            format,
            id,
            instance_id,
            metadata.file_count,
            metadata.size
        );
        Ok(BackupInfo {
            path: archive_path,
            metadata,
        })
    }

    /// Replace `data_dir` with the contents of `backup`. Blocking.
    ///
    /// The archive is extracted into a sibling staging directory first; the
    /// live directory is only swapped out once extraction has succeeded.
    pub(crate) fn restore_into(
        &self,
        backup: &BackupInfo,
        data_dir: &Path,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<()> {
        let parent = data_dir
            .parent()
            .ok_or_else(|| AppError::backup("Data directory has no parent"))?;
        fs::create_dir_all(parent)?;
        let name = data_dir
            .file_name()
            .map_or_else(|| "data".to_string(), |n| n.to_string_lossy().into_owned());
        let staging = parent.join(format!(".{name}.restore-{}", backup.metadata.id));
        let previous = parent.join(format!(".{name}.previous-{}", backup.metadata.id));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }

        let route = |raw: &str| map_prefixed_entry(raw, DATA_PREFIX, &staging);
        let extracted = match backup.metadata.format {
            ArchiveFormat::Zip => extract_zip_mapped(&backup.path, &staging, route, on_progress),
            ArchiveFormat::TarGz => {
                extract_tar_gz_mapped(&backup.path, &staging, route, on_progress)
            }
        };
        if let Err(e) = extracted {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                log::warn!("Failed to remove staging dir {:?}: {}", staging, cleanup);
            }
            return Err(AppError::backup(format!("Failed to extract backup: {}", e)));
        }

        if data_dir.exists() {
            fs::rename(data_dir, &previous).map_err(|e| {
                AppError::backup(format!("Failed to move current data aside: {}", e))
            })?;
        }
        if let Err(e) = fs::rename(&staging, data_dir) {
            if previous.exists() {
                if let Err(undo) = fs::rename(&previous, data_dir) {
                    log::error!("Failed to put back {:?}: {}", previous, undo);
                }
            }
            return Err(AppError::backup(format!(
                "Failed to move restored data into place: {}",
                e
            )));
        }
        if previous.exists() {
            if let Err(e) = fs::remove_dir_all(&previous) {
                log::warn!("Failed to remove replaced data {:?}: {}", previous, e);
            }
        }

        log::info!(
            "Restored backup {} into {}",
            backup.metadata.id,
            data_dir.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("world")).unwrap();
        fs::write(dir.join("server.properties"), "motd=hello\n").unwrap();
        fs::write(dir.join("world/level.dat"), vec![3u8; 2048]).unwrap();
    }

    fn archive(store: &BackupStore, data_dir: &Path, format: ArchiveFormat, auto: bool) -> BackupInfo {
        store
            .create_archive("srv1", "Survival", data_dir, format, auto, &mut |_| {})
            .unwrap()
    }

    #[test]
    fn created_archives_are_listed_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(DataPaths::new(dir.path()));
        let data_dir = dir.path().join("instances/srv1");
        populate(&data_dir);

        let first = archive(&store, &data_dir, ArchiveFormat::Zip, false);
        let second = archive(&store, &data_dir, ArchiveFormat::TarGz, false);
        let snapshot = archive(&store, &data_dir, ArchiveFormat::Zip, true);

        let listed = store.list("srv1", false).unwrap();
        let ids: Vec<&str> = listed.iter().map(|b| b.metadata.id.as_str()).collect();
        assert_eq!(ids, vec![second.metadata.id.as_str(), first.metadata.id.as_str()]);
        assert_eq!(listed[1].metadata.file_count, 2);
        assert!(listed[1].metadata.size > 0);
        assert_eq!(store.list("srv1", true).unwrap().len(), 3);

        let found = store.get("srv1", &snapshot.metadata.id).unwrap();
        assert!(found.metadata.auto_generated);
        assert_eq!(found.path, snapshot.path);
    }

    #[test]
    fn restore_replaces_the_data_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(DataPaths::new(dir.path()));
        let data_dir = dir.path().join("instances/srv1");
        populate(&data_dir);

        for format in [ArchiveFormat::Zip, ArchiveFormat::TarGz] {
            let backup = archive(&store, &data_dir, format, false);
            fs::write(data_dir.join("server.properties"), "motd=changed\n").unwrap();
            fs::write(data_dir.join("stray.log"), "x").unwrap();

            let mut seen = Vec::new();
            store
                .restore_into(&backup, &data_dir, &mut |p| seen.push(p))
                .unwrap();
            assert_eq!(seen.last(), Some(&100));
            assert_eq!(
                fs::read_to_string(data_dir.join("server.properties")).unwrap(),
                "motd=hello\n"
            );
            assert!(!data_dir.join("stray.log").exists());
            assert_eq!(fs::read(data_dir.join("world/level.dat")).unwrap().len(), 2048);
        }

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("instances"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("srv1")]);
    }

    #[test]
    fn missing_data_dir_leaves_no_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(DataPaths::new(dir.path()));
        let err = store
            .create_archive(
                "srv1",
                "",
                &dir.path().join("nope"),
                ArchiveFormat::Zip,
                false,
                &mut |_| {},
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Backup);
        assert!(store.list("srv1", true).unwrap().is_empty());
    }

    #[test]
    fn prune_keeps_newest_manual_backups() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(DataPaths::new(dir.path()));
        let data_dir = dir.path().join("instances/srv1");
        populate(&data_dir);

        let _oldest = archive(&store, &data_dir, ArchiveFormat::Zip, false);
        let snapshot = archive(&store, &data_dir, ArchiveFormat::Zip, true);
        let middle = archive(&store, &data_dir, ArchiveFormat::Zip, false);
        let newest = archive(&store, &data_dir, ArchiveFormat::Zip, false);

        let deleted = store.prune("srv1", 2).unwrap();
        assert_eq!(deleted.len(), 1);
        let kept: Vec<String> = store
            .list("srv1", true)
            .unwrap()
            .into_iter()
            .map(|b| b.metadata.id)
            .collect();
        assert_eq!(
            kept,
            vec![newest.metadata.id, middle.metadata.id, snapshot.metadata.id]
        );
    }

    #[test]
    fn lookups_reject_malformed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(DataPaths::new(dir.path()));
        assert!(store.get("srv1", "../config").is_err());
        assert!(store
            .delete("srv1", &uuid::Uuid::new_v4().to_string())
            .is_err());
    }
}
