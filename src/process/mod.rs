//! Supervision of game server processes.

mod control;
mod lease;
mod logs;
mod pidfile;
mod readiness;
mod supervisor;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use control::{check_port_available, force_kill, is_process_alive};
pub use lease::{port_lease, LeaseHolder, PortLease, ReleaseAck};
pub use logs::{LogBuffer, LogLine, LogStream};
pub use supervisor::{BusyGuard, Pending, Supervisor};

/// How long to wait for exit after a forced kill before giving up.
const KILL_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    Error,
}

impl InstanceState {
    /// Whether a process is (or is about to be) attached to the instance.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeEventReason {
    Spawned,
    Ready,
    StopRequested,
    Exited,
    Crashed,
    LaunchFailed,
    ReadinessFailed,
    Reset,
    /// A hold on the data directory ended.
    Released,
}

/// A state transition of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeEvent {
    pub instance_id: String,
    pub previous: InstanceState,
    pub state: InstanceState,
    pub reason: RuntimeEventReason,
    pub pid: Option<u32>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_ms: Option<u64>,
    pub last_error: Option<String>,
    /// Set while a restore owns the data directory.
    pub busy: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    /// Ask the server to exit before killing it.
    pub graceful: bool,
}

impl StopOptions {
    pub fn graceful() -> Self {
        Self { graceful: true }
    }

    pub fn force() -> Self {
        Self { graceful: false }
    }
}

impl Default for StopOptions {
    fn default() -> Self {
        Self::graceful()
    }
}
