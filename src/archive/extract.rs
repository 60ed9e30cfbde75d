//! Materializing extracted entries inside a restore staging directory.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use crate::error::{AppError, Result};

/// What an archive entry becomes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Staged {
    Dir,
    /// A regular file of `expected` bytes, as recorded in the archive.
    File { expected: u64 },
}

/// Create `target` from one archive entry and return the bytes written.
///
/// A file that comes out shorter or longer than recorded is deleted again so
/// no torn file is left behind in the staging directory.
pub(super) fn stage_entry(
    target: &Path,
    staged: Staged,
    body: &mut impl Read,
    mode: Option<u32>,
) -> Result<u64> {
    let Staged::File { expected } = staged else {
        fs::create_dir_all(target)
            .map_err(|e| AppError::io(format!("failed to create directory {target:?}: {e}")))?;
        return Ok(0);
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::io(format!("failed to create directory {parent:?}: {e}")))?;
    }
    let written = fs::File::create(target)
        .and_then(|mut file| io::copy(body, &mut file))
        .map_err(|e| AppError::io(format!("failed to write {target:?}: {e}")))?;

    if written != expected {
        if let Err(e) = fs::remove_file(target) {
            log::warn!("Failed to remove torn file {:?}: {}", target, e);
        }
        return Err(AppError::io(format!(
            "entry {target:?} has {written} bytes, archive recorded {expected}"
        )));
    }
    restore_mode(target, mode)?;
    Ok(written)
}

/// Owner read/write is always kept; setuid, setgid and sticky bits are dropped.
#[cfg(unix)]
fn restore_mode(target: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    let Some(bits) = mode.map(|m| (m & 0o777) | 0o600) else {
        return Ok(());
    };
    fs::set_permissions(target, fs::Permissions::from_mode(bits))
        .map_err(|e| AppError::io(format!("failed to set permissions on {target:?}: {e}")))
}

#[cfg(not(unix))]
fn restore_mode(_target: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}
