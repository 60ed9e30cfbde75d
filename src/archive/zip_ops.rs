use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

use super::extract::{stage_entry, Staged};
use super::{entry_name, parse_entry_rel_path, Progress, ProgressReader};

/// Write `dir` recursively into a new zip archive at `archive_path` under `prefix`.
///
/// Progress advances by one unit per file plus one per byte copied.
pub(crate) fn write_zip(
    dir: &Path,
    archive_path: &Path,
    prefix: &str,
    progress: &mut Progress<'_>,
) -> Result<()> {
    let file = fs::File::create(archive_path)
        .map_err(|e| AppError::io(format!("failed to create {archive_path:?}: {e}")))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();

    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(dir)
            .map_err(|e| AppError::io(e.to_string()))?;
        let archive_path = entry_name(prefix, relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if path != dir {
                writer
                    .add_directory(&archive_path, options)
                    .map_err(|e| AppError::io(e.to_string()))?;
            }
        } else if file_type.is_file() {
            let size = entry.metadata()?.len();
            writer
                .start_file(&archive_path, options.large_file(size >= u64::from(u32::MAX)))
                .map_err(|e| AppError::io(e.to_string()))?;
            let f = fs::File::open(path)
                .map_err(|e| AppError::io(format!("failed to open {path:?}: {e}")))?;
            let mut reader = ProgressReader::new(io::Read::take(f, size), progress);
            io::copy(&mut reader, &mut writer)
                .map_err(|e| AppError::io(format!("failed to archive {path:?}: {e}")))?;
            progress.advance(1);
        } else {
            log::warn!("Skipping non-regular file {:?} while archiving", path);
        }
    }

    writer
        .finish()
        .map_err(|e| AppError::io(format!("failed to finalize zip archive: {e}")))?;
    Ok(())
}

/// Extract zip entries using a caller-provided destination resolver.
///
/// Returning `None` from `destination_for` skips the entry. Progress is
/// reported as entries processed out of the archive's entry count.
pub(crate) fn extract_zip_mapped<F>(
    archive_path: &Path,
    dest_dir: &Path,
    mut destination_for: F,
    on_progress: &mut dyn FnMut(u8),
) -> Result<()>
where
    F: FnMut(&str) -> Option<PathBuf>,
{
    fs::create_dir_all(dest_dir).map_err(|e| AppError::io(e.to_string()))?;
    let file = fs::File::open(archive_path)
        .map_err(|e| AppError::io(format!("failed to open {archive_path:?}: {e}")))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| AppError::io(e.to_string()))?;
    let mut progress = Progress::new(archive.len() as u64, on_progress);
    let mut restored_bytes = 0u64;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| AppError::io(e.to_string()))?;

        let raw_name = entry.name().to_string();

        if parse_entry_rel_path(&raw_name).is_none() {
            return Err(AppError::io(format!(
                "archive contains unsafe zip path: {raw_name:?}"
            )));
        }

        if entry.is_symlink() {
            log::warn!("Skipping symlink entry {:?} in {:?}", raw_name, archive_path);
        } else if let Some(out_path) = destination_for(&raw_name) {
            let staged = if entry.is_dir() {
                Staged::Dir
            } else {
                Staged::File {
                    expected: entry.size(),
                }
            };
            let mode = entry.unix_mode();
            restored_bytes += stage_entry(&out_path, staged, &mut entry, mode)?;
        }

        progress.advance(1);
    }

    progress.finish();
    log::debug!("Extracted {} bytes from {:?}", restored_bytes, archive_path);
    Ok(())
}
