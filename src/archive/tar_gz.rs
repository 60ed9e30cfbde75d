use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{AppError, Result};

use super::extract::{stage_entry, Staged};
use super::{entry_name, parse_entry_rel_path, Progress, ProgressReader};

/// Write `dir` recursively into a new tar.gz archive at `archive_path` under `prefix`.
pub(crate) fn write_tar_gz(
    dir: &Path,
    archive_path: &Path,
    prefix: &str,
    progress: &mut Progress<'_>,
) -> Result<()> {
    let file = fs::File::create(archive_path)
        .map_err(|e| AppError::io(format!("failed to create {archive_path:?}: {e}")))?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(dir)
            .map_err(|e| AppError::io(e.to_string()))?;
        let archive_path = entry_name(prefix, relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if path == dir {
                continue;
            }
            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_mode(0o755);
            header.set_entry_type(tar::EntryType::Directory);
            builder
                .append_data(&mut header, &archive_path, io::empty())
                .map_err(|e| AppError::io(e.to_string()))?;
        } else if file_type.is_file() {
            let metadata = entry.metadata()?;
            let size = metadata.len();
            let mut header = tar::Header::new_gnu();
            header.set_metadata(&metadata);
            header.set_size(size);
            let f = fs::File::open(path)
                .map_err(|e| AppError::io(format!("failed to open {path:?}: {e}")))?;
            let reader = ProgressReader::new(io::Read::take(f, size), progress);
            builder
                .append_data(&mut header, &archive_path, reader)
                .map_err(|e| AppError::io(format!("failed to archive {path:?}: {e}")))?;
            progress.advance(1);
        } else {
            log::warn!("Skipping non-regular file {:?} while archiving", path);
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| AppError::io(format!("failed to finalize tar archive: {e}")))?;
    encoder
        .finish()
        .map_err(|e| AppError::io(format!("failed to finalize gzip stream: {e}")))?;
    Ok(())
}

/// Counts compressed bytes pulled from the archive file.
struct CountingReader<R> {
    inner: R,
    read: Arc<AtomicU64>,
}

impl<R: io::Read> io::Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Extract tar.gz entries using a caller-provided destination resolver.
///
/// Returning `None` from `destination_for` skips the entry. Progress is
/// reported as compressed bytes consumed out of the archive size.
pub(crate) fn extract_tar_gz_mapped<F>(
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
    let compressed_size = file.metadata().map(|m| m.len()).unwrap_or(0);
    let consumed = Arc::new(AtomicU64::new(0));
    let counting = CountingReader {
        inner: file,
        read: Arc::clone(&consumed),
    };
    let decoder = flate2::read::GzDecoder::new(counting);
    let mut archive = tar::Archive::new(decoder);
    let mut progress = Progress::new(compressed_size, on_progress);
    let mut restored_bytes = 0u64;

    for entry in archive
        .entries()
        .map_err(|error| AppError::io(error.to_string()))?
    {
        let mut entry = entry.map_err(|error| AppError::io(error.to_string()))?;

        let raw_path = {
            let entry_path = entry
                .path()
                .map_err(|error| AppError::io(error.to_string()))?;
            entry_path
                .as_ref()
                .to_str()
                .ok_or_else(|| {
                    AppError::io(format!(
                        "archive entry path is not valid UTF-8: {:?}",
                        entry_path
                    ))
                })?
                .to_string()
        };

        if parse_entry_rel_path(&raw_path).is_none() {
            return Err(AppError::io(format!(
                "archive contains unsafe entry path: {raw_path:?}"
            )));
        }

        let entry_type = entry.header().entry_type();
        if !entry_type.is_dir() && !entry_type.is_file() {
            log::warn!(
                "Skipping unsupported tar entry {:?} ({:?}) in {:?}",
                raw_path,
                entry_type,
                archive_path
            );
            continue;
        }

        let Some(out_path) = destination_for(&raw_path) else {
            continue;
        };

        let staged = if entry_type.is_dir() {
            Staged::Dir
        } else {
            Staged::File {
                expected: entry
                    .header()
                    .size()
                    .map_err(|error| AppError::io(error.to_string()))?,
            }
        };
        let mode = entry.header().mode().ok();
        restored_bytes += stage_entry(&out_path, staged, &mut entry, mode)?;
        progress.set(consumed.load(Ordering::Relaxed));
    }

    progress.finish();
    log::debug!("Extracted {} bytes from {:?}", restored_bytes, archive_path);
    Ok(())
}
