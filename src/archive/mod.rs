//! Archive writers and extractors used by the backup pipeline.
//!
//! Archives store the data directory under a single `data/` prefix. Extraction
//! goes through a caller-provided mapping so entries can be routed (or skipped)
//! before anything touches the filesystem.

mod extract;
mod tar_gz;
mod zip_ops;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub(crate) use tar_gz::{extract_tar_gz_mapped, write_tar_gz};
pub(crate) use zip_ops::{extract_zip_mapped, write_zip};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    #[default]
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Files and bytes below a directory, used as the progress denominator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub files: u64,
    pub bytes: u64,
}

impl TreeStats {
    /// Progress units: one per file plus one per byte, so empty files still count.
    pub fn units(&self) -> u64 {
        self.files + self.bytes
    }
}

/// Walk `dir` and count regular files and their sizes.
pub fn scan_tree(dir: &Path) -> crate::error::Result<TreeStats> {
    let mut stats = TreeStats::default();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file() {
            stats.files += 1;
            stats.bytes += entry.metadata()?.len();
        }
    }
    Ok(stats)
}

/// Percentage reporter that only fires when the integer percentage grows.
pub(crate) struct Progress<'a> {
    done: u64,
    total: u64,
    last_percent: Option<u8>,
    report: &'a mut dyn FnMut(u8),
}

impl<'a> Progress<'a> {
    pub(crate) fn new(total: u64, report: &'a mut dyn FnMut(u8)) -> Self {
        Self {
            done: 0,
            total,
            last_percent: None,
            report,
        }
    }

    pub(crate) fn advance(&mut self, units: u64) {
        self.done = self.done.saturating_add(units);
        self.emit();
    }

    /// Jump to an absolute position; never moves backwards.
    pub(crate) fn set(&mut self, done: u64) {
        self.done = self.done.max(done);
        self.emit();
    }

    pub(crate) fn finish(&mut self) {
        self.done = self.total;
        if self.last_percent != Some(100) {
            self.last_percent = Some(100);
            (self.report)(100);
        }
    }

    fn emit(&mut self) {
        let percent = if self.total == 0 {
            0
        } else {
            ((self.done.min(self.total) * 100) / self.total) as u8
        };
        if self.last_percent.map_or(true, |last| percent > last) {
            self.last_percent = Some(percent);
            (self.report)(percent);
        }
    }
}

/// Reader that feeds every byte read into a [`Progress`].
pub(crate) struct ProgressReader<'p, 'a, R> {
    inner: R,
    progress: &'p mut Progress<'a>,
}

impl<'p, 'a, R> ProgressReader<'p, 'a, R> {
    pub(crate) fn new(inner: R, progress: &'p mut Progress<'a>) -> Self {
        Self { inner, progress }
    }
}

impl<R: io::Read> io::Read for ProgressReader<'_, '_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.progress.advance(n as u64);
        Ok(n)
    }
}

fn has_windows_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// Convert an archive entry path to a relative PathBuf, rejecting empty,
/// absolute or traversal paths.
pub(crate) fn parse_entry_rel_path(raw: &str) -> Option<PathBuf> {
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') || has_windows_drive_prefix(&normalized) {
        return None;
    }

    let mut relative = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            _ => relative.push(part),
        }
    }

    if relative.as_os_str().is_empty() {
        return None;
    }
    Some(relative)
}

/// Map `<prefix>/<rest>` entries onto `dest_dir/<rest>`; everything else is skipped.
pub(crate) fn map_prefixed_entry(raw: &str, prefix: &str, dest_dir: &Path) -> Option<PathBuf> {
    let relative = parse_entry_rel_path(raw)?;
    let rest = relative.strip_prefix(prefix).ok()?;
    if rest.as_os_str().is_empty() {
        return None;
    }
    Some(dest_dir.join(rest))
}

/// Archive entry name for `relative` under `prefix`, always with `/` separators.
pub(crate) fn entry_name(prefix: &str, relative: &Path) -> String {
    let mut name = prefix.to_string();
    for component in relative.components() {
        name.push('/');
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("world/region")).unwrap();
        fs::write(root.join("server.properties"), "motd=hello\n").unwrap();
        fs::write(root.join("world/level.dat"), vec![7u8; 4096]).unwrap();
        fs::write(root.join("world/region/r.0.0.mca"), vec![1u8; 10_000]).unwrap();
        fs::write(root.join("empty.txt"), "").unwrap();
    }

    fn assert_same_tree(expected: &Path, actual: &Path) {
        for entry in walkdir::WalkDir::new(expected) {
            let entry = entry.unwrap();
            let relative = entry.path().strip_prefix(expected).unwrap();
            let other = actual.join(relative);
            if entry.file_type().is_file() {
                assert_eq!(fs::read(entry.path()).unwrap(), fs::read(&other).unwrap());
            } else {
                assert!(other.is_dir(), "missing dir {}", other.display());
            }
        }
    }

    fn archive_and_extract(format: ArchiveFormat) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let out = dir.path().join("out");
        sample_tree(&src);
        let archive = dir.path().join(format!("backup.{}", format.extension()));

        let stats = scan_tree(&src).unwrap();
        let mut seen = Vec::new();
        let mut record = |p: u8| seen.push(p);
        let mut progress = Progress::new(stats.units(), &mut record);
        match format {
            ArchiveFormat::Zip => write_zip(&src, &archive, "data", &mut progress).unwrap(),
            ArchiveFormat::TarGz => write_tar_gz(&src, &archive, "data", &mut progress).unwrap(),
        }
        progress.finish();
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));

        let mut extracted = Vec::new();
        let mut record_extract = |p: u8| extracted.push(p);
        let route = |raw: &str| map_prefixed_entry(raw, "data", &out);
        match format {
            ArchiveFormat::Zip => {
                extract_zip_mapped(&archive, &out, route, &mut record_extract).unwrap()
            }
            ArchiveFormat::TarGz => {
                extract_tar_gz_mapped(&archive, &out, route, &mut record_extract).unwrap()
            }
        }
        assert_eq!(extracted.last(), Some(&100));
        assert_same_tree(&src, &out);
    }

    #[test]
    fn zip_archives_round_trip_a_data_tree() {
        archive_and_extract(ArchiveFormat::Zip);
    }

    #[test]
    fn tar_gz_archives_round_trip_a_data_tree() {
        archive_and_extract(ArchiveFormat::TarGz);
    }

    #[test]
    fn entry_paths_reject_traversal() {
        assert!(parse_entry_rel_path("../etc/passwd").is_none());
        assert!(parse_entry_rel_path("/abs").is_none());
        assert!(parse_entry_rel_path("C:/windows").is_none());
        assert_eq!(
            parse_entry_rel_path("data\\world\\level.dat"),
            Some(PathBuf::from("data/world/level.dat"))
        );
    }

    #[test]
    fn progress_is_monotonic_and_sparse() {
        let mut seen = Vec::new();
        let mut record = |p: u8| seen.push(p);
        let mut progress = Progress::new(200, &mut record);
        progress.advance(1);
        progress.advance(1);
        progress.set(100);
        progress.set(50);
        progress.advance(100);
        progress.finish();
        assert_eq!(seen, vec![0, 1, 50, 100]);
    }
}
