//! Host error types.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Structured error returned by every control call.
#[derive(Debug)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Instance is not registered
    InstanceNotFound,
    /// Instance is already starting or running
    InstanceRunning,
    /// Instance is not running
    NotRunning,
    /// Configuration error
    Config,
    /// File system or archive error
    Io,
    /// Executable missing or spawn failed
    Launch,
    /// Port is held by another instance or process
    PortInUse,
    /// Readiness, stop or probe timed out
    Timeout,
    /// Signal or pipe error on a live process
    Process,
    /// Overlapping backup/restore or task run
    Conflict,
    /// Backup archive error
    Backup,
    /// Job id unknown or superseded
    JobNotFound,
    /// Scheduled task unknown
    TaskNotFound,
    /// Malformed schedule expression
    Schedule,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::InstanceNotFound => 1001,
            Self::InstanceRunning => 1002,
            Self::NotRunning => 1003,
            Self::Config => 2001,
            Self::Io => 2002,
            Self::Launch => 3001,
            Self::PortInUse => 3002,
            Self::Timeout => 3003,
            Self::Process => 3004,
            Self::Conflict => 4001,
            Self::Backup => 4002,
            Self::JobNotFound => 4003,
            Self::TaskNotFound => 5001,
            Self::Schedule => 5002,
            Self::Other => 9999,
        }
    }

    /// Whether the same call may succeed if repeated later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InstanceRunning | Self::PortInUse | Self::Timeout | Self::Conflict
        )
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn instance_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::InstanceNotFound,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn instance_running(id: &str) -> Self {
        Self::new(
            ErrorKind::InstanceRunning,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn not_running(id: &str) -> Self {
        Self::new(
            ErrorKind::NotRunning,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn launch(command: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Launch,
            HashMap::from([
                ("command".to_string(), command.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn port_in_use(port: u16, holder: Option<&str>) -> Self {
        let mut payload = HashMap::from([("port".to_string(), port.to_string())]);
        if let Some(holder) = holder {
            payload.insert("holder".to_string(), holder.to_string());
        }
        Self::new(ErrorKind::PortInUse, payload)
    }

    pub fn timeout(operation: &str, secs: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            HashMap::from([
                ("operation".to_string(), operation.to_string()),
                ("secs".to_string(), secs.to_string()),
            ]),
        )
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn conflict(id: &str, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Conflict,
            HashMap::from([
                ("id".to_string(), id.to_string()),
                ("reason".to_string(), reason.into()),
            ]),
        )
    }

    pub fn backup(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Backup, message)
    }

    pub fn job_not_found(job_id: &str) -> Self {
        Self::new(
            ErrorKind::JobNotFound,
            HashMap::from([("job_id".to_string(), job_id.to_string())]),
        )
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorKind::TaskNotFound,
            HashMap::from([("task_id".to_string(), task_id.to_string())]),
        )
    }

    pub fn schedule(expression: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Schedule,
            HashMap::from([
                ("expression".to_string(), expression.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn payload(&self) -> &HashMap<String, String> {
        &self.payload
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 4)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("retryable", &self.kind.is_retryable())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::io(err.to_string())
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
