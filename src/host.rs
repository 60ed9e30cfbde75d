//! The host: every component wired together behind one owned facade.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::archive::ArchiveFormat;
use crate::backup::{BackupInfo, BackupJob, BackupStore, JobPipeline, RestoreOptions};
use crate::config::{AppConfig, ConfigStore, SleepConfig};
use crate::error::Result;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::paths::DataPaths;
use crate::process::{
    InstanceState, InstanceStatus, LogLine, Pending, RuntimeEvent, StopOptions, Supervisor,
};
use crate::scheduler::{ScheduledTask, TaskEngine, TaskSpec};
use crate::sleep::{SleepManager, SleepStatus};

/// Everything a UI needs to draw the host at once.
#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub instances: Vec<InstanceStatus>,
    pub sleep: Vec<SleepStatus>,
    pub active_jobs: Vec<BackupJob>,
    pub tasks: Vec<ScheduledTask>,
    /// Latest cached sample of each instance that has one.
    pub metrics: Vec<MetricsSnapshot>,
}

pub struct Host {
    paths: DataPaths,
    config: Arc<ConfigStore>,
    supervisor: Arc<Supervisor>,
    metrics: Arc<MetricsCollector>,
    sleep: Arc<SleepManager>,
    jobs: Arc<JobPipeline>,
    tasks: Arc<TaskEngine>,
    shutdown: watch::Sender<bool>,
    tickers: Mutex<Vec<JoinHandle<()>>>,
}

impl Host {
    /// Load the config under `root`, register its instances and start the tickers.
    pub async fn boot(root: impl Into<PathBuf>) -> Result<Self> {
        let paths = DataPaths::new(root);
        paths.ensure_dirs()?;
        let config = Arc::new(ConfigStore::open(paths.config_path())?);
        let loaded = config.load();
        let settings = loaded.settings.clone();

        let supervisor = Arc::new(Supervisor::new(paths.clone(), settings.clone())?);
        for (id, instance) in &loaded.instances {
            supervisor.register(id, instance.clone());
        }
        for (id, pid) in supervisor.recover_orphans() {
            log::warn!("Reaped orphaned process {} of instance {}", pid, id);
        }

        let metrics = Arc::new(MetricsCollector::new(
            Arc::clone(&supervisor),
            Duration::from_millis(settings.probe_timeout_ms),
        ));
        let sleep = Arc::new(SleepManager::new(
            Arc::clone(&supervisor),
            Arc::clone(&metrics),
            Arc::clone(&config),
        ));
        let jobs = Arc::new(JobPipeline::new(
            Arc::clone(&supervisor),
            BackupStore::new(paths.clone()),
            settings.event_buffer,
        ));
        let tasks = Arc::new(TaskEngine::load(
            paths.tasks_path(),
            Arc::clone(&supervisor),
            Arc::clone(&jobs),
            Arc::clone(&sleep),
        )?);

        sleep.sync_all().await;

        let (shutdown, signal) = watch::channel(false);
        let tickers = vec![
            tokio::spawn(Arc::clone(&sleep).run(
                Duration::from_secs(settings.idle_scan_secs.max(1)),
                signal.clone(),
            )),
            tokio::spawn(Arc::clone(&tasks).run(
                Duration::from_secs(settings.task_tick_secs.max(1)),
                signal.clone(),
            )),
            tokio::spawn(Arc::clone(&metrics).run(
                Duration::from_secs(settings.metrics_interval_secs.max(1)),
                signal,
            )),
        ];
        log::info!(
            "Host started with {} instances at {}",
            loaded.instances.len(),
            paths.root().display()
        );

        Ok(Self {
            paths,
            config,
            supervisor,
            metrics,
            sleep,
            jobs,
            tasks,
            shutdown,
            tickers: Mutex::new(tickers),
        })
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    /// Current contents of `config.toml`, including sleep setting changes.
    pub fn config(&self) -> Arc<AppConfig> {
        self.config.load()
    }

    pub fn snapshot(&self) -> Result<HostSnapshot> {
        let instances = self.supervisor.statuses();
        let sleep = instances
            .iter()
            .map(|status| self.sleep.status(&status.instance_id))
            .collect::<Result<Vec<_>>>()?;
        let active_jobs = instances
            .iter()
            .filter_map(|status| self.jobs.active_job(&status.instance_id))
            .collect();
        let metrics = instances
            .iter()
            .filter_map(|status| self.metrics.cached(&status.instance_id))
            .collect();
        Ok(HostSnapshot {
            instances,
            sleep,
            active_jobs,
            tasks: self.tasks.list(None),
            metrics,
        })
    }

    // === Lifecycle ===

    pub fn status(&self, instance_id: &str) -> Result<InstanceStatus> {
        self.supervisor.status(instance_id)
    }

    pub async fn start(&self, instance_id: &str) -> Result<Pending> {
        self.supervisor.start(instance_id).await
    }

    pub async fn stop(&self, instance_id: &str, options: StopOptions) -> Result<Pending> {
        self.supervisor.stop(instance_id, options).await
    }

    pub async fn restart(&self, instance_id: &str) -> Result<Pending> {
        self.supervisor.restart(instance_id).await
    }

    pub async fn send_command(&self, instance_id: &str, command: &str) -> Result<()> {
        self.supervisor.send_command(instance_id, command).await
    }

    /// Clear a crashed or errored state back to stopped.
    pub async fn reset(&self, instance_id: &str) -> Result<InstanceState> {
        self.supervisor.reset(instance_id).await
    }

    /// Buffered log lines plus a receiver for new ones.
    pub fn logs(&self, instance_id: &str) -> Result<(Vec<LogLine>, broadcast::Receiver<LogLine>)> {
        self.supervisor.logs(instance_id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.supervisor.subscribe_events()
    }

    /// Sample the instance now.
    pub async fn metrics(&self, instance_id: &str) -> Result<MetricsSnapshot> {
        self.metrics.sample(instance_id).await
    }

    /// Last sample taken by the metrics ticker or by [`Host::metrics`].
    pub fn latest_metrics(&self, instance_id: &str) -> Result<Option<MetricsSnapshot>> {
        self.supervisor.instance_config(instance_id)?;
        Ok(self.metrics.cached(instance_id))
    }

    // === Sleep ===

    pub fn sleep_settings(&self, instance_id: &str) -> Result<SleepConfig> {
        self.sleep.get_settings(instance_id)
    }

    pub async fn update_sleep_settings(
        &self,
        instance_id: &str,
        settings: SleepConfig,
    ) -> Result<SleepStatus> {
        self.sleep.update_settings(instance_id, settings).await
    }

    pub fn sleep_status(&self, instance_id: &str) -> Result<SleepStatus> {
        self.sleep.status(instance_id)
    }

    pub async fn sleep_now(&self, instance_id: &str) -> Result<()> {
        self.sleep.sleep_now(instance_id).await
    }

    // === Backups ===

    pub fn create_backup(&self, instance_id: &str, format: Option<ArchiveFormat>) -> Result<String> {
        self.jobs.create_backup(instance_id, format)
    }

    pub fn list_backups(&self, instance_id: &str, include_auto: bool) -> Result<Vec<BackupInfo>> {
        self.supervisor.instance_config(instance_id)?;
        self.jobs.store().list(instance_id, include_auto)
    }

    pub fn delete_backup(&self, instance_id: &str, backup_id: &str) -> Result<()> {
        self.jobs.store().delete(instance_id, backup_id)
    }

    /// Archive file to hand to a download.
    pub fn backup_path(&self, instance_id: &str, backup_id: &str) -> Result<PathBuf> {
        self.jobs.store().archive_path(instance_id, backup_id)
    }

    pub fn restore_backup(
        &self,
        instance_id: &str,
        backup_id: &str,
        options: RestoreOptions,
    ) -> Result<String> {
        self.jobs.restore_backup(instance_id, backup_id, options)
    }

    pub fn job_status(&self, instance_id: &str, job_id: &str) -> Result<BackupJob> {
        self.jobs.get_job(instance_id, job_id)
    }

    pub fn clear_job(&self, instance_id: &str, job_id: &str) -> Result<()> {
        self.jobs.clear_job(instance_id, job_id)
    }

    pub fn subscribe_jobs(&self) -> broadcast::Receiver<BackupJob> {
        self.jobs.subscribe()
    }

    // === Scheduled tasks ===

    pub fn list_tasks(&self, instance_id: Option<&str>) -> Vec<ScheduledTask> {
        self.tasks.list(instance_id)
    }

    pub fn get_task(&self, task_id: &str) -> Result<ScheduledTask> {
        self.tasks.get(task_id)
    }

    pub fn create_task(&self, spec: TaskSpec) -> Result<ScheduledTask> {
        self.tasks.create(spec)
    }

    pub fn update_task(&self, task_id: &str, spec: TaskSpec) -> Result<ScheduledTask> {
        self.tasks.update(task_id, spec)
    }

    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        self.tasks.delete(task_id)
    }

    pub fn toggle_task(&self, task_id: &str, enabled: bool) -> Result<ScheduledTask> {
        self.tasks.toggle(task_id, enabled)
    }

    pub fn run_task_now(&self, task_id: &str) -> Result<ScheduledTask> {
        self.tasks.run_now(task_id)
    }

    /// Stop the tickers, let in-flight work finish, then stop every instance.
    pub async fn shutdown(&self) {
        log::info!("Shutting down host");
        let _ = self.shutdown.send(true);
        let tickers: Vec<JoinHandle<()>> = {
            let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
            tickers.drain(..).collect()
        };
        futures_util::future::join_all(tickers).await;

        self.tasks.drain().await;
        self.jobs.drain().await;
        self.sleep.shutdown().await;
        self.supervisor.shutdown().await;
        log::info!("Host stopped");
    }
}
