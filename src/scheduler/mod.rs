//! Scheduled tasks persisted to `tasks.json` and fired by a periodic tick.

mod cron;
mod task;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backup::{BackupJob, JobPipeline, JobStatus};
use crate::error::{AppError, Result};
use crate::process::{StopOptions, Supervisor};
use crate::sleep::SleepManager;

pub use cron::CronSchedule;
use task::Trigger;
pub use task::{Schedule, ScheduledTask, TaskAction, TaskRunResult, TaskSpec};

#[derive(Debug, Clone)]
struct Entry {
    task: ScheduledTask,
    /// `None` when a stored schedule no longer parses; the task stays disabled.
    trigger: Option<Trigger>,
}

impl Entry {
    fn reschedule(&mut self, from: DateTime<Utc>) {
        self.task.next_run_at = if self.task.enabled {
            self.trigger.as_ref().and_then(|t| t.next_after(from))
        } else {
            None
        };
    }
}

/// Owns the task list and runs due tasks against the other components.
pub struct TaskEngine {
    path: PathBuf,
    supervisor: Arc<Supervisor>,
    jobs: Arc<JobPipeline>,
    sleep: Arc<SleepManager>,
    tasks: Mutex<BTreeMap<String, Entry>>,
    /// Orders writes of the task file; taken before `tasks`.
    persist: Mutex<()>,
    running: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskEngine {
    /// Load tasks from `path`; a missing file means no tasks.
    ///
    /// Runs interrupted by a host crash are forgotten, not resumed.
    pub fn load(
        path: impl Into<PathBuf>,
        supervisor: Arc<Supervisor>,
        jobs: Arc<JobPipeline>,
        sleep: Arc<SleepManager>,
    ) -> Result<Self> {
        let path = path.into();
        let stored = read_tasks(&path)?;
        let now = Utc::now();

        let mut tasks = BTreeMap::new();
        for mut task in stored {
            task.running = false;
            let trigger = match Trigger::compile(&task.schedule) {
                Ok(trigger) => Some(trigger),
                Err(e) => {
                    log::warn!("Disabling task {} with an invalid schedule: {}", task.id, e);
                    task.enabled = false;
                    None
                }
            };
            let mut entry = Entry { task, trigger };
            if !entry.task.enabled || entry.task.next_run_at.is_none() {
                entry.reschedule(now);
            }
            tasks.insert(entry.task.id.clone(), entry);
        }
        log::info!("Loaded {} scheduled tasks", tasks.len());

        Ok(Self {
            path,
            supervisor,
            jobs,
            sleep,
            tasks: Mutex::new(tasks),
            persist: Mutex::new(()),
            running: Mutex::new(Vec::new()),
        })
    }

    /// Tasks ordered by creation time, optionally for one instance only.
    pub fn list(&self, instance_id: Option<&str>) -> Vec<ScheduledTask> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut listed: Vec<ScheduledTask> = tasks
            .values()
            .filter(|entry| instance_id.map_or(true, |id| entry.task.instance_id == id))
            .map(|entry| entry.task.clone())
            .collect();
        drop(tasks);
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        listed
    }

    pub fn get(&self, task_id: &str) -> Result<ScheduledTask> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks.get(task_id).map(|entry| entry.task.clone());
        drop(tasks);
        task.ok_or_else(|| AppError::task_not_found(task_id))
    }

    pub fn create(&self, spec: TaskSpec) -> Result<ScheduledTask> {
        self.supervisor.instance_config(&spec.instance_id)?;
        let trigger = spec.validate()?;
        let now = Utc::now();
        let mut entry = Entry {
            task: ScheduledTask {
                id: uuid::Uuid::new_v4().to_string(),
                name: spec.name,
                instance_id: spec.instance_id,
                action: spec.action,
                schedule: spec.schedule,
                enabled: spec.enabled,
                created_at: now,
                last_run_at: None,
                next_run_at: None,
                running: false,
                last_result: None,
            },
            trigger: Some(trigger),
        };
        entry.reschedule(now);
        let task = entry.task.clone();

        self.with_tasks(|tasks| {
            tasks.insert(task.id.clone(), entry);
            Ok(())
        })?;
        log::info!(
            "Created {} task {} for instance {}",
            task.action.name(),
            task.id,
            task.instance_id
        );
        Ok(task)
    }

    /// Replace the editable fields of a task that is not running.
    pub fn update(&self, task_id: &str, spec: TaskSpec) -> Result<ScheduledTask> {
        self.supervisor.instance_config(&spec.instance_id)?;
        let trigger = spec.validate()?;
        let now = Utc::now();
        self.with_tasks(|tasks| {
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| AppError::task_not_found(task_id))?;
            if entry.task.running {
                return Err(AppError::conflict(&entry.task.instance_id, "task is running"));
            }
            entry.task.name = spec.name;
            entry.task.instance_id = spec.instance_id;
            entry.task.action = spec.action;
            entry.task.schedule = spec.schedule;
            entry.task.enabled = spec.enabled;
            entry.trigger = Some(trigger);
            entry.reschedule(now);
            Ok(entry.task.clone())
        })
    }

    pub fn delete(&self, task_id: &str) -> Result<()> {
        self.with_tasks(|tasks| {
            let entry = tasks
                .get(task_id)
                .ok_or_else(|| AppError::task_not_found(task_id))?;
            if entry.task.running {
                return Err(AppError::conflict(&entry.task.instance_id, "task is running"));
            }
            tasks.remove(task_id);
            Ok(())
        })?;
        log::info!("Deleted task {}", task_id);
        Ok(())
    }

    pub fn toggle(&self, task_id: &str, enabled: bool) -> Result<ScheduledTask> {
        let now = Utc::now();
        self.with_tasks(|tasks| {
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| AppError::task_not_found(task_id))?;
            if enabled && entry.trigger.is_none() {
                return Err(AppError::schedule(
                    &schedule_label(&entry.task.schedule),
                    "fix the schedule before enabling the task",
                ));
            }
            entry.task.enabled = enabled;
            entry.reschedule(now);
            Ok(entry.task.clone())
        })
    }

    /// Fire a task immediately, outside its schedule.
    pub fn run_now(self: &Arc<Self>, task_id: &str) -> Result<ScheduledTask> {
        let now = Utc::now();
        let task = self.with_tasks(|tasks| {
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| AppError::task_not_found(task_id))?;
            if entry.task.running {
                return Err(AppError::conflict(
                    &entry.task.instance_id,
                    format!("task {} is already running", task_id),
                ));
            }
            entry.task.running = true;
            Ok(entry.task.clone())
        })?;
        self.spawn_run(task.clone(), now);
        Ok(task)
    }

    /// Fire every enabled task that is due at `now` and not already running.
    ///
    /// The task file is only rewritten when a task was claimed or scheduled.
    /// Claims stay in effect even if that write fails. Returns the ids of the
    /// tasks started.
    pub fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<String> {
        let persist = self.persist.lock().unwrap_or_else(|e| e.into_inner());
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut scheduled = false;
        let mut due = Vec::new();
        for entry in tasks.values_mut().filter(|entry| entry.task.enabled) {
            if entry.task.next_run_at.is_none() {
                entry.reschedule(now);
                scheduled |= entry.task.next_run_at.is_some();
            }
            let is_due = entry.task.next_run_at.is_some_and(|at| at <= now);
            if is_due && !entry.task.running {
                entry.task.running = true;
                due.push(entry.task.clone());
            }
        }
        let snapshot: Option<Vec<ScheduledTask>> = (scheduled || !due.is_empty())
            .then(|| tasks.values().map(|entry| entry.task.clone()).collect());
        drop(tasks);

        if let Some(snapshot) = snapshot {
            if let Err(e) = write_tasks(&self.path, snapshot.iter()) {
                log::warn!("Failed to persist claimed tasks, running them anyway: {}", e);
            }
        }
        drop(persist);

        due.into_iter()
            .map(|task| {
                let id = task.id.clone();
                self.spawn_run(task, now);
                id
            })
            .collect()
    }

    /// Wait for every task run that is still in flight.
    pub async fn drain(&self) {
        let running: Vec<JoinHandle<()>> = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running.drain(..).collect()
        };
        futures_util::future::join_all(running).await;
    }

    /// Tick every `every` until `shutdown` changes.
    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let started = self.tick(Utc::now());
                    if !started.is_empty() {
                        log::debug!("Started {} scheduled tasks", started.len());
                    }
                }
            }
        }
    }

    fn spawn_run(self: &Arc<Self>, task: ScheduledTask, fired_at: DateTime<Utc>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.execute(task, fired_at).await });
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.retain(|handle| !handle.is_finished());
        running.push(handle);
    }

    async fn execute(&self, task: ScheduledTask, fired_at: DateTime<Utc>) {
        log::info!(
            "Running {} task {} on instance {}",
            task.action.name(),
            task.id,
            task.instance_id
        );
        let outcome = self.dispatch(&task.instance_id, &task.action).await;
        let result = match outcome {
            Ok(message) => {
                log::info!("Task {} succeeded: {}", task.id, message);
                TaskRunResult {
                    success: true,
                    message,
                    finished_at: Utc::now(),
                }
            }
            Err(e) => {
                log::warn!("Task {} failed: {}", task.id, e);
                TaskRunResult {
                    success: false,
                    message: e.to_string(),
                    finished_at: Utc::now(),
                }
            }
        };

        let recorded = self.with_tasks(|tasks| {
            if let Some(entry) = tasks.get_mut(&task.id) {
                entry.task.running = false;
                entry.task.last_run_at = Some(fired_at);
                entry.task.last_result = Some(result);
                entry.reschedule(fired_at);
            }
            Ok(())
        });
        if let Err(e) = recorded {
            log::error!("Failed to record run of task {}: {}", task.id, e);
            self.release(&task.id, fired_at);
        }
    }

    /// Clear the running flag in memory when the run could not be persisted.
    fn release(&self, task_id: &str, fired_at: DateTime<Utc>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = tasks.get_mut(task_id) {
            entry.task.running = false;
            entry.task.last_run_at = Some(fired_at);
            entry.reschedule(fired_at);
        }
        drop(tasks);
    }

    async fn dispatch(&self, instance_id: &str, action: &TaskAction) -> Result<String> {
        if !matches!(action, TaskAction::Command { .. }) {
            if let Some(job) = self.jobs.active_job(instance_id) {
                return Err(AppError::conflict(
                    instance_id,
                    format!("{} job {} is in progress", job.kind, job.id),
                ));
            }
        }

        match action {
            TaskAction::Backup { format } => {
                let mut updates = self.jobs.subscribe();
                let job_id = self.jobs.create_backup(instance_id, *format)?;
                let job = self.wait_job(instance_id, &job_id, &mut updates).await?;
                if job.status == JobStatus::Completed {
                    Ok(format!(
                        "Created backup {}",
                        job.backup_id.unwrap_or_default()
                    ))
                } else {
                    Err(AppError::backup(
                        job.error.unwrap_or_else(|| "backup failed".to_string()),
                    ))
                }
            }
            TaskAction::Restart => {
                self.supervisor.restart(instance_id).await?.wait().await?;
                Ok("Instance restarted".to_string())
            }
            TaskAction::Stop => {
                self.supervisor
                    .stop(instance_id, StopOptions::graceful())
                    .await?
                    .wait()
                    .await?;
                Ok("Instance stopped".to_string())
            }
            TaskAction::Start => {
                self.supervisor.start(instance_id).await?.wait().await?;
                Ok("Instance started".to_string())
            }
            TaskAction::Command { command } => {
                self.supervisor.send_command(instance_id, command).await?;
                Ok(format!("Sent {:?}", command))
            }
            TaskAction::Sleep => {
                self.sleep.sleep_now(instance_id).await?;
                Ok("Instance is asleep".to_string())
            }
        }
    }

    async fn wait_job(
        &self,
        instance_id: &str,
        job_id: &str,
        updates: &mut broadcast::Receiver<BackupJob>,
    ) -> Result<BackupJob> {
        loop {
            match updates.recv().await {
                Ok(job) if job.id == job_id && job.status.is_terminal() => return Ok(job),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let job = self.jobs.get_job(instance_id, job_id)?;
                    if job.status.is_terminal() {
                        return Ok(job);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return self.jobs.get_job(instance_id, job_id);
                }
            }
        }
    }

    /// Read-modify-write of the task list, persisted before it becomes visible.
    fn with_tasks<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Entry>) -> Result<T>,
    ) -> Result<T> {
        let persist = self.persist.lock().unwrap_or_else(|e| e.into_inner());
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut updated = tasks.clone();
        let result = f(&mut updated)?;
        write_tasks(&self.path, updated.values().map(|entry| &entry.task))?;
        *tasks = updated;
        drop(tasks);
        drop(persist);
        Ok(result)
    }
}

fn schedule_label(schedule: &Schedule) -> String {
    match schedule {
        Schedule::Interval { minutes } => format!("every {minutes} minutes"),
        Schedule::Cron { expression } => expression.clone(),
    }
}

fn read_tasks(path: &Path) -> Result<Vec<ScheduledTask>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .map_err(|e| AppError::config(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| AppError::config(format!("Failed to parse {}: {}", path.display(), e)))
}

fn write_tasks<'a>(path: &Path, tasks: impl Iterator<Item = &'a ScheduledTask>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tasks: Vec<&ScheduledTask> = tasks.collect();
    let content = serde_json::to_string_pretty(&tasks)?;
    fs::write(path, content)
        .map_err(|e| AppError::io(format!("Failed to write {}: {}", path.display(), e)))
}

#[cfg(all(test, unix))]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::backup::BackupStore;
    use crate::config::{AppConfig, ConfigStore, HostSettings, InstanceConfig, Readiness};
    use crate::error::ErrorKind;
    use crate::metrics::MetricsCollector;
    use crate::paths::DataPaths;
    use crate::process::InstanceState;

    struct Fixture {
        dir: tempfile::TempDir,
        supervisor: Arc<Supervisor>,
        jobs: Arc<JobPipeline>,
        sleep: Arc<SleepManager>,
        engine: Arc<TaskEngine>,
    }

    impl Fixture {
        fn reload(&self) -> TaskEngine {
            TaskEngine::load(
                DataPaths::new(self.dir.path()).tasks_path(),
                Arc::clone(&self.supervisor),
                Arc::clone(&self.jobs),
                Arc::clone(&self.sleep),
            )
            .unwrap()
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        let config = InstanceConfig {
            name: "Survival".to_string(),
            data_dir: None,
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            env: Default::default(),
            port: portpicker::pick_unused_port().unwrap(),
            protocol: crate::config::StatusProtocol::Java,
            stop_command: None,
            readiness: Readiness::Immediate,
            limits: Default::default(),
            sleep: Default::default(),
            backup: Default::default(),
        };
        let settings = HostSettings {
            stop_timeout_secs: 5,
            ..HostSettings::default()
        };
        let supervisor = Arc::new(Supervisor::new(paths.clone(), settings).unwrap());
        supervisor.register("srv1", config.clone());
        let data_dir = supervisor.data_dir("srv1").unwrap();
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join("server.properties"), "motd=hello\n").unwrap();

        let mut app = AppConfig::default();
        app.instances.insert("srv1".to_string(), config);
        let store = Arc::new(ConfigStore::from_config(paths.config_path(), app));
        let metrics = Arc::new(MetricsCollector::new(
            Arc::clone(&supervisor),
            Duration::from_millis(500),
        ));
        let sleep = Arc::new(SleepManager::new(Arc::clone(&supervisor), metrics, store));
        let jobs = Arc::new(JobPipeline::new(
            Arc::clone(&supervisor),
            BackupStore::new(paths.clone()),
            256,
        ));
        let engine = Arc::new(
            TaskEngine::load(
                paths.tasks_path(),
                Arc::clone(&supervisor),
                Arc::clone(&jobs),
                Arc::clone(&sleep),
            )
            .unwrap(),
        );
        Fixture {
            dir,
            supervisor,
            jobs,
            sleep,
            engine,
        }
    }

    fn spec(action: TaskAction, schedule: Schedule) -> TaskSpec {
        TaskSpec {
            name: "nightly".to_string(),
            instance_id: "srv1".to_string(),
            action,
            schedule,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn interval_task_reschedules_from_its_run_time() {
        let f = fixture();
        let task = f
            .engine
            .create(spec(TaskAction::Start, Schedule::Interval { minutes: 60 }))
            .unwrap();
        let first = task.next_run_at.unwrap();
        assert_eq!(first, task.created_at + TimeDelta::minutes(60));

        assert!(f.engine.tick(first - TimeDelta::seconds(1)).is_empty());
        assert_eq!(f.engine.tick(first), vec![task.id.clone()]);
        f.engine.drain().await;

        let ran = f.engine.get(&task.id).unwrap();
        assert!(!ran.running);
        assert_eq!(ran.last_run_at, Some(first));
        assert_eq!(ran.next_run_at, Some(first + TimeDelta::minutes(60)));
        assert!(ran.last_result.unwrap().success);
        assert_eq!(f.supervisor.status("srv1").unwrap().state, InstanceState::Running);

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn idle_tick_leaves_the_task_file_alone() {
        let f = fixture();
        let task = f
            .engine
            .create(spec(TaskAction::Start, Schedule::Interval { minutes: 60 }))
            .unwrap();
        let path = DataPaths::new(f.dir.path()).tasks_path();
        fs::remove_file(&path).unwrap();

        assert!(f
            .engine
            .tick(task.next_run_at.unwrap() - TimeDelta::seconds(1))
            .is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn due_tasks_run_when_the_task_file_cannot_be_written() {
        let f = fixture();
        let task = f
            .engine
            .create(spec(TaskAction::Start, Schedule::Interval { minutes: 60 }))
            .unwrap();
        let due = task.next_run_at.unwrap();
        let path = DataPaths::new(f.dir.path()).tasks_path();
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert_eq!(f.engine.tick(due), vec![task.id.clone()]);
        f.engine.drain().await;

        let ran = f.engine.get(&task.id).unwrap();
        assert!(!ran.running);
        assert_eq!(ran.last_run_at, Some(due));
        assert_eq!(ran.next_run_at, Some(due + TimeDelta::minutes(60)));
        assert_eq!(f.supervisor.status("srv1").unwrap().state, InstanceState::Running);
        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn running_task_is_not_triggered_again() {
        let f = fixture();
        let task = f
            .engine
            .create(spec(TaskAction::Start, Schedule::Interval { minutes: 1 }))
            .unwrap();
        let due = task.next_run_at.unwrap();

        assert_eq!(f.engine.tick(due).len(), 1);
        assert!(f.engine.tick(due + TimeDelta::minutes(5)).is_empty());
        let err = f.engine.run_now(&task.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = f.engine.delete(&task.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        f.engine.drain().await;
        assert!(!f.engine.get(&task.id).unwrap().running);
        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn task_conflicting_with_an_active_job_fails_fast() {
        let f = fixture();
        let task = f
            .engine
            .create(spec(
                TaskAction::Backup { format: None },
                Schedule::Cron {
                    expression: "0 4 * * *".to_string(),
                },
            ))
            .unwrap();

        f.jobs.create_backup("srv1", None).unwrap();
        f.engine.run_now(&task.id).unwrap();
        f.engine.drain().await;
        f.jobs.drain().await;

        let ran = f.engine.get(&task.id).unwrap();
        let result = ran.last_result.unwrap();
        assert!(!result.success);
        assert!(ran.enabled);
        assert!(ran.next_run_at.is_some());
        assert_eq!(f.jobs.store().list("srv1", true).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backup_task_waits_for_its_job() {
        let f = fixture();
        let task = f
            .engine
            .create(spec(
                TaskAction::Backup {
                    format: Some(crate::archive::ArchiveFormat::TarGz),
                },
                Schedule::Interval { minutes: 30 },
            ))
            .unwrap();
        f.engine.run_now(&task.id).unwrap();
        f.engine.drain().await;

        let result = f.engine.get(&task.id).unwrap().last_result.unwrap();
        assert!(result.success, "{}", result.message);
        let backups = f.jobs.store().list("srv1", false).unwrap();
        assert_eq!(backups.len(), 1);
        assert!(result.message.contains(&backups[0].metadata.id));
    }

    #[tokio::test]
    async fn failed_runs_are_recorded_without_disabling_the_task() {
        let f = fixture();
        let task = f
            .engine
            .create(spec(
                TaskAction::Command {
                    command: "say hi".to_string(),
                },
                Schedule::Interval { minutes: 5 },
            ))
            .unwrap();
        f.engine.run_now(&task.id).unwrap();
        f.engine.drain().await;

        let ran = f.engine.get(&task.id).unwrap();
        assert!(!ran.last_result.unwrap().success);
        assert!(ran.enabled);
    }

    #[tokio::test]
    async fn tasks_persist_across_reloads() {
        let f = fixture();
        let kept = f
            .engine
            .create(spec(TaskAction::Restart, Schedule::Interval { minutes: 10 }))
            .unwrap();
        let removed = f
            .engine
            .create(spec(TaskAction::Stop, Schedule::Interval { minutes: 10 }))
            .unwrap();
        f.engine.toggle(&kept.id, false).unwrap();
        f.engine.delete(&removed.id).unwrap();

        let reloaded = f.reload();
        let tasks = reloaded.list(Some("srv1"));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, kept.id);
        assert!(!tasks[0].enabled);
        assert!(tasks[0].next_run_at.is_none());
        assert_eq!(
            reloaded.get(&removed.id).unwrap_err().kind(),
            ErrorKind::TaskNotFound
        );

        let enabled = reloaded.toggle(&kept.id, true).unwrap();
        assert!(enabled.next_run_at.is_some());
    }

    #[tokio::test]
    async fn invalid_tasks_are_rejected() {
        let f = fixture();
        let mut unknown = spec(TaskAction::Start, Schedule::Interval { minutes: 5 });
        unknown.instance_id = "ghost".to_string();
        assert_eq!(
            f.engine.create(unknown).unwrap_err().kind(),
            ErrorKind::InstanceNotFound
        );

        let bad_cron = spec(
            TaskAction::Start,
            Schedule::Cron {
                expression: "61 * * * *".to_string(),
            },
        );
        assert_eq!(
            f.engine.create(bad_cron).unwrap_err().kind(),
            ErrorKind::Schedule
        );
        assert!(f.engine.list(None).is_empty());
    }
}
