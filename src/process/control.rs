//! Platform-agnostic process control functions.

use std::path::{Path, PathBuf};

use crate::config::StatusProtocol;
use crate::error::{AppError, Result};

/// A pid is alive while its exit code still reads `STILL_ACTIVE`.
#[cfg(target_os = "windows")]
pub fn is_process_alive(pid: u32) -> bool {
    use windows::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    // SAFETY: the handle is only used inside this block and closed before leaving it.
    unsafe {
        let Ok(handle) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) else {
            return false;
        };
        let mut code = 0u32;
        let queried = GetExitCodeProcess(handle, &mut code).is_ok();
        let _ = CloseHandle(handle);
        queried && code as i32 == STILL_ACTIVE.0
    }
}

/// Check if a process is alive by PID.
#[cfg(not(target_os = "windows"))]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Ask the process to close its console window.
#[cfg(target_os = "windows")]
pub(super) fn terminate_signal(pid: u32) -> Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .status()
        .map_err(|e| AppError::process(format!("Failed to run taskkill: {e}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(AppError::process(format!(
            "taskkill refused graceful close of pid {pid}"
        )))
    }
}

/// Send SIGTERM to the process.
#[cfg(not(target_os = "windows"))]
pub(super) fn terminate_signal(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| AppError::process(format!("Failed to send SIGTERM to PID {}: {}", pid, e)))
}

#[cfg(target_os = "windows")]
pub fn force_kill(pid: u32) -> Result<()> {
    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .map_err(|e| AppError::process(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        Err(AppError::process(format!(
            "taskkill failed for pid {}: {}",
            pid,
            if detail.is_empty() {
                "(no output)"
            } else {
                detail
            }
        )))
    }
}

/// Kill the whole process group started for the instance.
#[cfg(not(target_os = "windows"))]
pub fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    match getpgid(Some(target)) {
        Ok(pgid) => killpg(pgid, Signal::SIGKILL).map_err(|e| {
            AppError::process(format!(
                "Failed to kill process group {} (from pid {}): {}",
                pgid.as_raw(),
                pid,
                e
            ))
        }),
        Err(e) => kill(target, Signal::SIGKILL).map_err(|kill_err| {
            AppError::process(format!(
                "Failed to kill process {} (getpgid failed: {}): {}",
                pid, e, kill_err
            ))
        }),
    }
}

/// Check that nothing else on the host listens on `port`.
pub fn check_port_available(port: u16, protocol: StatusProtocol) -> Result<()> {
    match protocol {
        StatusProtocol::Bedrock => {
            std::net::UdpSocket::bind(("0.0.0.0", port))
                .map_err(|_| AppError::port_in_use(port, None))?;
        }
        StatusProtocol::Java | StatusProtocol::None => {
            std::net::TcpListener::bind(("0.0.0.0", port))
                .map_err(|_| AppError::port_in_use(port, None))?;
        }
    }
    Ok(())
}

/// Resolve a launch command to an executable path.
///
/// Commands containing a path separator are taken relative to `cwd`; bare
/// names are searched on `PATH`.
pub fn resolve_executable(command: &str, cwd: &Path) -> Result<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            cwd.join(candidate)
        };
        return if path.is_file() {
            Ok(path)
        } else {
            Err(AppError::launch(command, "executable not found"))
        };
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&search) {
        for name in executable_names(command) {
            let path = dir.join(&name);
            if path.is_file() {
                return Ok(path);
            }
        }
    }
    Err(AppError::launch(command, "executable not found on PATH"))
}

#[cfg(target_os = "windows")]
fn executable_names(command: &str) -> Vec<String> {
    if Path::new(command).extension().is_some() {
        vec![command.to_string()]
    } else {
        vec![
            format!("{command}.exe"),
            format!("{command}.bat"),
            format!("{command}.cmd"),
        ]
    }
}

#[cfg(not(target_os = "windows"))]
fn executable_names(command: &str) -> Vec<String> {
    vec![command.to_string()]
}

/// Expand `{port}`, `{data_dir}` and `{max_memory_mb}` in launch arguments.
pub fn expand_args(
    args: &[String],
    port: u16,
    data_dir: &Path,
    max_memory_mb: Option<u64>,
) -> Vec<String> {
    let data_dir = data_dir.display().to_string();
    args.iter()
        .map(|arg| {
            let mut arg = arg
                .replace("{port}", &port.to_string())
                .replace("{data_dir}", &data_dir);
            if let Some(limit) = max_memory_mb {
                arg = arg.replace("{max_memory_mb}", &limit.to_string());
            }
            arg
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_expanded() {
        let args = vec![
            "-Xmx{max_memory_mb}M".to_string(),
            "--port={port}".to_string(),
            "--world={data_dir}/world".to_string(),
        ];
        let expanded = expand_args(&args, 25565, Path::new("/srv/mc"), Some(2048));
        assert_eq!(
            expanded,
            vec!["-Xmx2048M", "--port=25565", "--world=/srv/mc/world"]
        );
    }

    #[test]
    fn unset_memory_limit_leaves_placeholder() {
        let args = vec!["-Xmx{max_memory_mb}M".to_string()];
        let expanded = expand_args(&args, 1, Path::new("/"), None);
        assert_eq!(expanded, vec!["-Xmx{max_memory_mb}M"]);
    }

    #[cfg(unix)]
    #[test]
    fn bare_commands_resolve_on_path() {
        let resolved = resolve_executable("sh", Path::new("/")).unwrap();
        assert!(resolved.is_file());

        let err = resolve_executable("definitely-not-a-real-binary-1234", Path::new("/"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Launch);
    }

    #[test]
    fn relative_commands_resolve_against_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run.sh"), "#!/bin/sh\n").unwrap();
        assert!(resolve_executable("./run.sh", dir.path()).is_ok());
        assert!(resolve_executable("./missing.sh", dir.path()).is_err());
    }

    #[test]
    fn occupied_port_is_reported() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = check_port_available(port, StatusProtocol::Java).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PortInUse);
        drop(listener);
        assert!(check_port_available(port, StatusProtocol::Java).is_ok());
    }
}
