use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::ArchiveFormat;
use crate::error::{AppError, Result};

use super::cron::CronSchedule;

/// What a task does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TaskAction {
    Backup {
        #[serde(default)]
        format: Option<ArchiveFormat>,
    },
    Restart,
    Stop,
    Start,
    /// Console line written to the server's stdin.
    Command { command: String },
    Sleep,
}

impl TaskAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Backup { .. } => "backup",
            Self::Restart => "restart",
            Self::Stop => "stop",
            Self::Start => "start",
            Self::Command { .. } => "command",
            Self::Sleep => "sleep",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Interval { minutes: u32 },
    Cron { expression: String },
}

/// Parsed form of a [`Schedule`], built once per task.
#[derive(Debug, Clone)]
pub(super) enum Trigger {
    Every(TimeDelta),
    Cron(CronSchedule),
}

impl Trigger {
    pub(super) fn compile(schedule: &Schedule) -> Result<Self> {
        match schedule {
            Schedule::Interval { minutes: 0 } => Err(AppError::schedule(
                "interval",
                "interval must be at least one minute",
            )),
            Schedule::Interval { minutes } => TimeDelta::try_minutes(i64::from(*minutes))
                .map(Self::Every)
                .ok_or_else(|| AppError::schedule("interval", "interval is too long")),
            Schedule::Cron { expression } => CronSchedule::parse(expression).map(Self::Cron),
        }
    }

    /// When to fire next, counting from `from`.
    pub(super) fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(every) => from.checked_add_signed(*every),
            Self::Cron(cron) => cron.next_after(from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunResult {
    pub success: bool,
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub instance_id: String,
    pub action: TaskAction,
    pub schedule: Schedule,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub last_result: Option<TaskRunResult>,
}

fn default_enabled() -> bool {
    true
}

/// User-editable part of a task, for create and update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub name: String,
    pub instance_id: String,
    pub action: TaskAction,
    pub schedule: Schedule,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl TaskSpec {
    pub(super) fn validate(&self) -> Result<Trigger> {
        if let TaskAction::Command { command } = &self.action {
            if command.trim().is_empty() {
                return Err(AppError::config("Command task needs a console command"));
            }
        }
        Trigger::compile(&self.schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_round_trip_through_json() {
        let json = r#"{
            "id": "t1",
            "instance_id": "srv1",
            "action": {"type": "command", "payload": {"command": "save-all"}},
            "schedule": {"kind": "cron", "expression": "0 4 * * *"},
            "created_at": "2024-03-01T00:00:00Z"
        }"#;
        let task: ScheduledTask = serde_json::from_str(json).unwrap();
        assert!(task.enabled);
        assert!(!task.running);
        assert_eq!(
            task.action,
            TaskAction::Command {
                command: "save-all".to_string()
            }
        );

        let restart: TaskAction = serde_json::from_str(r#"{"type": "restart"}"#).unwrap();
        assert_eq!(restart, TaskAction::Restart);
    }

    #[test]
    fn interval_trigger_adds_the_interval() {
        let trigger = Trigger::compile(&Schedule::Interval { minutes: 60 }).unwrap();
        let t = Utc::now();
        assert_eq!(trigger.next_after(t), Some(t + TimeDelta::minutes(60)));
        assert!(Trigger::compile(&Schedule::Interval { minutes: 0 }).is_err());
    }

    #[test]
    fn empty_commands_are_rejected() {
        let spec = TaskSpec {
            name: String::new(),
            instance_id: "srv1".to_string(),
            action: TaskAction::Command {
                command: "  ".to_string(),
            },
            schedule: Schedule::Interval { minutes: 5 },
            enabled: true,
        };
        assert_eq!(spec.validate().unwrap_err().kind(), crate::error::ErrorKind::Config);
    }
}
