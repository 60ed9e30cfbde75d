//! Asynchronous backup and restore jobs with progress tracking.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::archive::ArchiveFormat;
use crate::error::{AppError, Result};
use crate::process::{InstanceState, StopOptions, Supervisor};

use super::{BackupInfo, BackupStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backup,
    Restore,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backup => f.write_str("backup"),
            Self::Restore => f.write_str("restore"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Steps of a restore, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStep {
    Stopped,
    Snapshot,
    Extracted,
    Started,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    /// Stop a running instance first instead of refusing.
    pub force_stop: bool,
    /// Archive the current data before overwriting it.
    pub pre_restore_snapshot: bool,
    pub auto_start: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupJob {
    pub id: String,
    pub instance_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    /// 0-100, never decreasing until the job is terminal.
    pub progress: u8,
    pub message: String,
    pub error: Option<String>,
    /// Archive written by a backup job, or restored by a restore job.
    pub backup_id: Option<String>,
    pub completed_step: Option<RestoreStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupJob {
    fn new(instance_id: &str, kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            kind,
            status: JobStatus::Pending,
            progress: 0,
            message: format!("Waiting to start {kind}"),
            error: None,
            backup_id: None,
            completed_step: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// Slice of the overall progress bar a sub-operation reports into.
#[derive(Debug, Clone, Copy)]
struct Phase {
    start: u8,
    span: u8,
}

impl Phase {
    const WHOLE: Self = Self {
        start: 0,
        span: 100,
    };

    fn scale(self, percent: u8) -> u8 {
        let scaled = u16::from(percent.min(100)) * u16::from(self.span) / 100;
        self.start.saturating_add(scaled as u8)
    }
}

/// Runs backup and restore jobs, at most one active per instance.
///
/// Only the latest job of each instance is kept; a new job supersedes a
/// terminal one.
pub struct JobPipeline {
    supervisor: Arc<Supervisor>,
    store: BackupStore,
    jobs: Mutex<HashMap<String, BackupJob>>,
    updates: broadcast::Sender<BackupJob>,
    running: Mutex<Vec<JoinHandle<()>>>,
}

impl JobPipeline {
    pub fn new(supervisor: Arc<Supervisor>, store: BackupStore, event_buffer: usize) -> Self {
        let (updates, _) = broadcast::channel(event_buffer.max(1));
        Self {
            supervisor,
            store,
            jobs: Mutex::new(HashMap::new()),
            updates,
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    /// Every job state change, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<BackupJob> {
        self.updates.subscribe()
    }

    pub fn get_job(&self, instance_id: &str, job_id: &str) -> Result<BackupJob> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get(instance_id)
            .filter(|job| job.id == job_id)
            .cloned();
        drop(jobs);
        job.ok_or_else(|| AppError::job_not_found(job_id))
    }

    /// The job currently pending or running for `instance_id`.
    pub fn active_job(&self, instance_id: &str) -> Option<BackupJob> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get(instance_id)
            .filter(|job| !job.status.is_terminal())
            .cloned();
        drop(jobs);
        job
    }

    /// Forget a finished job.
    pub fn clear_job(&self, instance_id: &str, job_id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get(instance_id) {
            Some(job) if job.id == job_id && job.status.is_terminal() => {
                jobs.remove(instance_id);
                Ok(())
            }
            Some(job) if job.id == job_id => Err(AppError::conflict(
                instance_id,
                format!("{} job {} is still running", job.kind, job.id),
            )),
            _ => Err(AppError::job_not_found(job_id)),
        }
    }

    /// Queue a backup and return its job id.
    pub fn create_backup(
        self: &Arc<Self>,
        instance_id: &str,
        format: Option<ArchiveFormat>,
    ) -> Result<String> {
        let config = self.supervisor.instance_config(instance_id)?;
        let format = format.unwrap_or(config.backup.default_format);
        let job_id = self.claim(instance_id, JobKind::Backup)?;
        log::info!(
            "Queued {} backup of instance {} (job: {})",
            format,
            instance_id,
            job_id
        );

        let this = Arc::clone(self);
        let (id, job) = (instance_id.to_string(), job_id.clone());
        self.track(tokio::spawn(async move {
            this.run_backup(&id, &job, format).await;
        }));
        Ok(job_id)
    }

    /// Queue a restore of `backup_id` and return its job id.
    pub fn restore_backup(
        self: &Arc<Self>,
        instance_id: &str,
        backup_id: &str,
        options: RestoreOptions,
    ) -> Result<String> {
        let state = self.supervisor.status(instance_id)?.state;
        let backup = self.store.get(instance_id, backup_id)?;
        if state.is_active() && !options.force_stop {
            return Err(AppError::conflict(
                instance_id,
                "instance is running; stop it first or restore with force_stop",
            ));
        }
        let job_id = self.claim(instance_id, JobKind::Restore)?;
        log::info!(
            "Queued restore of backup {} into instance {} (job: {})",
            backup_id,
            instance_id,
            job_id
        );

        let this = Arc::clone(self);
        let (id, job) = (instance_id.to_string(), job_id.clone());
        self.track(tokio::spawn(async move {
            this.run_restore(&id, &job, backup, options).await;
        }));
        Ok(job_id)
    }

    /// Wait for every job task that is still running.
    pub async fn drain(&self) {
        let running: Vec<JoinHandle<()>> = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running.drain(..).collect()
        };
        if !running.is_empty() {
            log::info!("Waiting for {} backup jobs to finish", running.len());
        }
        futures_util::future::join_all(running).await;
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.retain(|handle| !handle.is_finished());
        running.push(handle);
    }

    fn claim(&self, instance_id: &str, kind: JobKind) -> Result<String> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = jobs.get(instance_id).filter(|job| !job.status.is_terminal()) {
            return Err(AppError::conflict(
                instance_id,
                format!("{} job {} is in progress", active.kind, active.id),
            ));
        }
        let job = BackupJob::new(instance_id, kind);
        let job_id = job.id.clone();
        jobs.insert(instance_id.to_string(), job.clone());
        drop(jobs);
        let _ = self.updates.send(job);
        Ok(job_id)
    }

    /// Apply `f` to a job that is still live. Terminal jobs are frozen.
    fn update(&self, instance_id: &str, job_id: &str, f: impl FnOnce(&mut BackupJob)) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs
            .get_mut(instance_id)
            .filter(|job| job.id == job_id && !job.status.is_terminal())
        else {
            return;
        };
        f(job);
        job.updated_at = Utc::now();
        let snapshot = job.clone();
        drop(jobs);
        let _ = self.updates.send(snapshot);
    }

    fn set_progress(&self, instance_id: &str, job_id: &str, percent: u8) {
        let current = {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.get(instance_id).map(|job| job.progress)
        };
        if current.is_some_and(|current| percent > current) {
            self.update(instance_id, job_id, |job| {
                job.progress = job.progress.max(percent);
            });
        }
    }

    fn set_message(&self, instance_id: &str, job_id: &str, message: &str) {
        self.update(instance_id, job_id, |job| {
            job.status = JobStatus::Running;
            job.message = message.to_string();
        });
    }

    fn finish(&self, instance_id: &str, job_id: &str, outcome: Result<()>) {
        self.update(instance_id, job_id, |job| {
            job.finished_at = Some(Utc::now());
            match &outcome {
                Ok(()) => {
                    job.status = JobStatus::Completed;
                    job.progress = 100;
                    job.message = format!("{} completed", job.kind);
                }
                Err(e) => {
                    job.status = JobStatus::Failed;
                    job.message = format!("{} failed", job.kind);
                    job.error = Some(e.to_string());
                }
            }
        });
        match outcome {
            Ok(()) => log::info!("Job {} of instance {} completed", job_id, instance_id),
            Err(e) => log::error!("Job {} of instance {} failed: {}", job_id, instance_id, e),
        }
    }

    async fn run_backup(self: &Arc<Self>, instance_id: &str, job_id: &str, format: ArchiveFormat) {
        self.set_message(instance_id, job_id, "Archiving data directory");
        let outcome = self
            .archive(instance_id, job_id, format, false, Phase::WHOLE)
            .await
            .map(|backup| {
                let backup_id = backup.metadata.id;
                self.update(instance_id, job_id, |job| job.backup_id = Some(backup_id));
            });
        if outcome.is_ok() {
            self.apply_retention(instance_id).await;
        }
        self.finish(instance_id, job_id, outcome);
    }

    async fn apply_retention(&self, instance_id: &str) {
        let Some(keep) = self
            .supervisor
            .instance_config(instance_id)
            .ok()
            .and_then(|config| config.backup.max_backups)
        else {
            return;
        };
        let store = self.store.clone();
        let id = instance_id.to_string();
        match tokio::task::spawn_blocking(move || store.prune(&id, keep)).await {
            Ok(Ok(deleted)) if !deleted.is_empty() => log::info!(
                "Pruned {} old backups of instance {}",
                deleted.len(),
                instance_id
            ),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::warn!("Failed to prune backups of instance {}: {}", instance_id, e),
            Err(e) => log::warn!("Backup pruning task failed: {}", e),
        }
    }

    /// Write an archive of the instance's data directory.
    ///
    /// A running instance gets its pre and post console commands around it.
    async fn archive(
        self: &Arc<Self>,
        instance_id: &str,
        job_id: &str,
        format: ArchiveFormat,
        auto_generated: bool,
        phase: Phase,
    ) -> Result<BackupInfo> {
        let config = self.supervisor.instance_config(instance_id)?;
        let data_dir = self.supervisor.data_dir(instance_id)?;
        let running = self.supervisor.status(instance_id)?.state == InstanceState::Running;
        if running {
            self.send_console(instance_id, &config.backup.pre_commands).await;
        }

        let this = Arc::clone(self);
        let (id, job) = (instance_id.to_string(), job_id.to_string());
        let written = tokio::task::spawn_blocking(move || {
            let mut report = |percent: u8| this.set_progress(&id, &job, phase.scale(percent));
            this.store
                .create_archive(&id, &config.name, &data_dir, format, auto_generated, &mut report)
        })
        .await
        .map_err(|e| AppError::backup(format!("Backup task failed: {}", e)))
        .and_then(|written| written);

        if running {
            let post = self
                .supervisor
                .instance_config(instance_id)
                .map(|config| config.backup.post_commands)
                .unwrap_or_default();
            self.send_console(instance_id, &post).await;
        }
        written
    }

    async fn send_console(&self, instance_id: &str, commands: &[String]) {
        for command in commands {
            if let Err(e) = self.supervisor.send_command(instance_id, command).await {
                log::warn!(
                    "Failed to send backup command {:?} to instance {}: {}",
                    command,
                    instance_id,
                    e
                );
            }
        }
    }

    async fn run_restore(
        self: &Arc<Self>,
        instance_id: &str,
        job_id: &str,
        backup: BackupInfo,
        options: RestoreOptions,
    ) {
        let outcome = self.restore_steps(instance_id, job_id, &backup, options).await;
        self.finish(instance_id, job_id, outcome);
    }

    async fn restore_steps(
        self: &Arc<Self>,
        instance_id: &str,
        job_id: &str,
        backup: &BackupInfo,
        options: RestoreOptions,
    ) -> Result<()> {
        let backup_id = backup.metadata.id.clone();
        self.update(instance_id, job_id, |job| job.backup_id = Some(backup_id));

        let state = self.supervisor.status(instance_id)?.state;
        if state.is_active() {
            if !options.force_stop {
                return Err(AppError::conflict(instance_id, "instance was started"));
            }
            self.set_message(instance_id, job_id, "Stopping instance");
        }
        // Stopped and marked in one step, so no wake listener binds in between.
        let stop = options.force_stop.then(StopOptions::graceful);
        let busy = self
            .supervisor
            .hold(instance_id, "restore in progress", stop)
            .await?;
        self.step_done(instance_id, job_id, RestoreStep::Stopped, 5);

        let extract_phase = if options.pre_restore_snapshot {
            self.set_message(instance_id, job_id, "Snapshotting current data");
            let snapshot_phase = Phase { start: 5, span: 40 };
            let format = backup.metadata.format;
            let snapshot = self
                .archive(instance_id, job_id, format, true, snapshot_phase)
                .await?;
            log::info!(
                "Saved pre-restore snapshot {} of instance {}",
                snapshot.metadata.id,
                instance_id
            );
            self.step_done(instance_id, job_id, RestoreStep::Snapshot, 45);
            Phase { start: 45, span: 50 }
        } else {
            Phase { start: 5, span: 90 }
        };

        self.set_message(instance_id, job_id, "Extracting backup");
        let data_dir = self.supervisor.data_dir(instance_id)?;
        let this = Arc::clone(self);
        let (id, job, archive) = (instance_id.to_string(), job_id.to_string(), backup.clone());
        tokio::task::spawn_blocking(move || {
            let mut report = |percent: u8| this.set_progress(&id, &job, extract_phase.scale(percent));
            this.store.restore_into(&archive, &data_dir, &mut report)
        })
        .await
        .map_err(|e| AppError::backup(format!("Restore task failed: {}", e)))??;
        drop(busy);
        self.step_done(instance_id, job_id, RestoreStep::Extracted, 95);

        if options.auto_start {
            self.set_message(instance_id, job_id, "Starting instance");
            self.supervisor.start(instance_id).await?.wait().await?;
            self.step_done(instance_id, job_id, RestoreStep::Started, 100);
        }
        Ok(())
    }

    fn step_done(&self, instance_id: &str, job_id: &str, step: RestoreStep, progress: u8) {
        self.update(instance_id, job_id, |job| {
            job.completed_step = Some(step);
            job.progress = job.progress.max(progress);
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::*;
    use crate::config::{HostSettings, InstanceConfig, Readiness};
    use crate::paths::DataPaths;

    struct Fixture {
        _dir: tempfile::TempDir,
        supervisor: Arc<Supervisor>,
        pipeline: Arc<JobPipeline>,
    }

    fn instance(args: &[&str]) -> InstanceConfig {
        InstanceConfig {
            name: "Survival".to_string(),
            data_dir: None,
            command: "sh".to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            env: Default::default(),
            port: portpicker::pick_unused_port().unwrap(),
            protocol: crate::config::StatusProtocol::Java,
            stop_command: None,
            readiness: Readiness::Immediate,
            limits: Default::default(),
            sleep: Default::default(),
            backup: Default::default(),
        }
    }

    fn fixture(config: InstanceConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        let settings = HostSettings {
            stop_timeout_secs: 5,
            ..HostSettings::default()
        };
        let supervisor = Arc::new(Supervisor::new(paths.clone(), settings).unwrap());
        supervisor.register("srv1", config);
        let data_dir = supervisor.data_dir("srv1").unwrap();
        fs::create_dir_all(data_dir.join("world")).unwrap();
        fs::write(data_dir.join("server.properties"), "motd=original\n").unwrap();
        fs::write(data_dir.join("world/level.dat"), vec![9u8; 64 * 1024]).unwrap();

        let pipeline = Arc::new(JobPipeline::new(
            Arc::clone(&supervisor),
            BackupStore::new(paths),
            512,
        ));
        Fixture {
            _dir: dir,
            supervisor,
            pipeline,
        }
    }

    async fn wait_job(pipeline: &JobPipeline, job_id: &str) -> BackupJob {
        for _ in 0..400 {
            let job = pipeline.get_job("srv1", job_id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        pipeline.get_job("srv1", job_id).unwrap()
    }

    fn data_file(supervisor: &Supervisor, name: &str) -> std::path::PathBuf {
        supervisor.data_dir("srv1").unwrap().join(name)
    }

    #[tokio::test]
    async fn second_concurrent_backup_is_rejected() {
        let f = fixture(instance(&["-c", "sleep 30"]));
        let results = [
            f.pipeline.create_backup("srv1", None),
            f.pipeline.create_backup("srv1", Some(ArchiveFormat::TarGz)),
        ];
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);

        let job_id = results[0].as_ref().unwrap();
        let job = wait_job(&f.pipeline, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert!(f.pipeline.active_job("srv1").is_none());
    }

    #[tokio::test]
    async fn backup_progress_is_monotonic_and_completes() {
        let f = fixture(instance(&["-c", "sleep 30"]));
        let mut updates = f.pipeline.subscribe();
        let job_id = f.pipeline.create_backup("srv1", None).unwrap();

        let mut seen = Vec::new();
        loop {
            let job = updates.recv().await.unwrap();
            assert_eq!(job.id, job_id);
            seen.push(job.progress);
            if job.status.is_terminal() {
                assert_eq!(job.status, JobStatus::Completed);
                let backup_id = job.backup_id.unwrap();
                let listed = f.pipeline.store().list("srv1", false).unwrap();
                assert_eq!(listed[0].metadata.id, backup_id);
                assert_eq!(listed[0].metadata.file_count, 2);
                break;
            }
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert_eq!(seen.last(), Some(&100));
    }

    #[tokio::test]
    async fn forced_restore_stops_the_server_before_overwriting() {
        // The server leaves a marker in its data directory when asked to stop.
        let f = fixture(instance(&[
            "-c",
            "trap 'echo bye > stopped.txt; exit 0' TERM; while true; do sleep 0.1; done",
        ]));
        let backup_job = f.pipeline.create_backup("srv1", None).unwrap();
        let backup_id = wait_job(&f.pipeline, &backup_job).await.backup_id.unwrap();

        fs::write(data_file(&f.supervisor, "server.properties"), "motd=changed\n").unwrap();
        f.supervisor.start("srv1").await.unwrap().wait().await.unwrap();

        let refused = f
            .pipeline
            .restore_backup("srv1", &backup_id, RestoreOptions::default())
            .unwrap_err();
        assert_eq!(refused.kind(), crate::error::ErrorKind::Conflict);

        let options = RestoreOptions {
            force_stop: true,
            pre_restore_snapshot: true,
            auto_start: false,
        };
        let job_id = f.pipeline.restore_backup("srv1", &backup_id, options).unwrap();
        let job = wait_job(&f.pipeline, &job_id).await;
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
        assert_eq!(job.completed_step, Some(RestoreStep::Extracted));

        assert_eq!(f.supervisor.status("srv1").unwrap().state, InstanceState::Stopped);
        assert!(!data_file(&f.supervisor, "stopped.txt").exists());
        assert_eq!(
            fs::read_to_string(data_file(&f.supervisor, "server.properties")).unwrap(),
            "motd=original\n"
        );
        assert_eq!(f.pipeline.store().list("srv1", true).unwrap().len(), 2);
        assert_eq!(f.pipeline.store().list("srv1", false).unwrap().len(), 1);
        assert!(f.supervisor.status("srv1").unwrap().busy.is_none());
    }

    #[tokio::test]
    async fn restore_with_auto_start_runs_the_server_again() {
        let f = fixture(instance(&["-c", "sleep 30"]));
        let backup_job = f.pipeline.create_backup("srv1", None).unwrap();
        let backup_id = wait_job(&f.pipeline, &backup_job).await.backup_id.unwrap();

        let options = RestoreOptions {
            auto_start: true,
            ..RestoreOptions::default()
        };
        let job_id = f.pipeline.restore_backup("srv1", &backup_id, options).unwrap();
        let job = wait_job(&f.pipeline, &job_id).await;
        assert_eq!(job.completed_step, Some(RestoreStep::Started));
        assert_eq!(job.progress, 100);
        assert_eq!(f.supervisor.status("srv1").unwrap().state, InstanceState::Running);

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn failed_restore_records_the_last_completed_step() {
        let f = fixture(instance(&["-c", "sleep 30"]));
        let backup_job = f.pipeline.create_backup("srv1", None).unwrap();
        let backup_id = wait_job(&f.pipeline, &backup_job).await.backup_id.unwrap();
        let archive = f.pipeline.store().archive_path("srv1", &backup_id).unwrap();
        fs::write(&archive, b"not a zip").unwrap();

        let job_id = f
            .pipeline
            .restore_backup("srv1", &backup_id, RestoreOptions::default())
            .unwrap();
        let job = wait_job(&f.pipeline, &job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.completed_step, Some(RestoreStep::Stopped));
        assert!(job.error.is_some());
        assert_eq!(
            fs::read_to_string(data_file(&f.supervisor, "server.properties")).unwrap(),
            "motd=original\n"
        );
        assert!(f.supervisor.status("srv1").unwrap().busy.is_none());
    }

    #[tokio::test]
    async fn superseded_and_cleared_jobs_are_not_found() {
        let f = fixture(instance(&["-c", "sleep 30"]));
        let first = f.pipeline.create_backup("srv1", None).unwrap();
        wait_job(&f.pipeline, &first).await;
        let second = f.pipeline.create_backup("srv1", None).unwrap();

        let err = f.pipeline.get_job("srv1", &first).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::JobNotFound);

        wait_job(&f.pipeline, &second).await;
        f.pipeline.clear_job("srv1", &second).unwrap();
        assert!(f.pipeline.get_job("srv1", &second).is_err());
    }

    #[tokio::test]
    async fn retention_prunes_old_backups() {
        let mut config = instance(&["-c", "sleep 30"]);
        config.backup.max_backups = Some(1);
        let f = fixture(config);

        let mut last = None;
        for _ in 0..3 {
            let job_id = f.pipeline.create_backup("srv1", None).unwrap();
            last = wait_job(&f.pipeline, &job_id).await.backup_id;
        }
        let listed = f.pipeline.store().list("srv1", false).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(Some(listed[0].metadata.id.clone()), last);
    }
}
