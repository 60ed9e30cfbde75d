//! Pid files for reclaiming servers left behind by a previous host process.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::error::{AppError, Result};

use super::control::{force_kill, is_process_alive};

/// Tolerated difference between recorded and observed start times.
const START_TIME_SLACK_SECS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PidRecord {
    pid: u32,
    /// Seconds since the epoch as reported by the OS, if known.
    started_at: Option<u64>,
}

fn process_start_time(pid: u32) -> Option<u64> {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::new(),
    );
    system.process(target).map(|process| process.start_time())
}

pub(super) fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::io(format!("failed to create {parent:?}: {e}")))?;
    }
    let record = PidRecord {
        pid,
        started_at: process_start_time(pid),
    };
    let content = toml::to_string(&record)?;
    fs::write(path, content).map_err(|e| AppError::io(format!("failed to write {path:?}: {e}")))
}

pub(super) fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove pid file {:?}: {}", path, e);
        }
    }
}

/// Kill the process recorded in `path` if it is still the one we spawned.
///
/// Returns the pid that was killed. The pid file is removed either way.
pub(super) fn reap_orphan(path: &Path, instance_id: &str) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    remove_pid_file(path);

    let record: PidRecord = match toml::from_str(&content) {
        Ok(record) => record,
        Err(e) => {
            log::warn!("Ignoring unreadable pid file {:?}: {}", path, e);
            return None;
        }
    };

    if !is_process_alive(record.pid) {
        return None;
    }

    // A reused pid belongs to some unrelated process; leave it alone.
    let observed = process_start_time(record.pid);
    if let (Some(recorded), Some(observed)) = (record.started_at, observed) {
        if recorded.abs_diff(observed) > START_TIME_SLACK_SECS {
            log::info!(
                "Pid {} from {:?} was reused by another process, not killing",
                record.pid,
                path
            );
            return None;
        }
    }

    log::warn!(
        "Killing orphaned process of instance {} (pid: {})",
        instance_id,
        record.pid
    );
    match force_kill(record.pid) {
        Ok(()) => Some(record.pid),
        Err(e) => {
            log::error!("Failed to kill orphan pid {}: {}", record.pid, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_pid_file_is_removed_without_killing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv1.pid");
        let record = PidRecord {
            pid: 0x3FFF_FFF0,
            started_at: Some(1),
        };
        fs::write(&path, toml::to_string(&record).unwrap()).unwrap();

        assert_eq!(reap_orphan(&path, "srv1"), None);
        assert!(!path.exists());
    }

    #[test]
    fn reused_pid_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv1.pid");
        let me = std::process::id();
        let record = PidRecord {
            pid: me,
            started_at: Some(process_start_time(me).unwrap().saturating_sub(3600)),
        };
        fs::write(&path, toml::to_string(&record).unwrap()).unwrap();

        assert_eq!(reap_orphan(&path, "srv1"), None);
        assert!(is_process_alive(me));
    }

    #[cfg(unix)]
    #[test]
    fn live_orphan_is_killed() {
        use std::os::unix::process::CommandExt as _;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv1.pid");
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        write_pid_file(&path, pid).unwrap();

        assert_eq!(reap_orphan(&path, "srv1"), Some(pid));
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
