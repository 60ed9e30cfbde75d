//! Per-instance process ownership and the lifecycle state machine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWriteExt as _, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::{HostSettings, InstanceConfig};
use crate::error::{AppError, Result};
use crate::paths::DataPaths;

use super::control::{
    check_port_available, expand_args, force_kill, resolve_executable, terminate_signal,
};
use super::lease::{port_lease, LeaseHolder, PortLease};
use super::logs::{LogBuffer, LogLine, LogStream};
use super::pidfile::{reap_orphan, remove_pid_file, write_pid_file};
use super::readiness::{wait_ready, ReadinessProbe};
use super::{
    InstanceState, InstanceStatus, RuntimeEvent, RuntimeEventReason, StopOptions, KILL_WAIT,
};

/// Acknowledgment of an accepted lifecycle operation.
///
/// The operation proceeds in the background whether or not this is awaited.
#[derive(Debug)]
#[must_use = "dropping a Pending does not cancel the operation"]
pub struct Pending(Option<JoinHandle<Result<()>>>);

impl Pending {
    fn done() -> Self {
        Self(None)
    }

    fn task(handle: JoinHandle<Result<()>>) -> Self {
        Self(Some(handle))
    }

    /// Wait for the operation to finish.
    pub async fn wait(self) -> Result<()> {
        let Some(handle) = self.0 else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(AppError::process("operation was cancelled")),
            Err(e) => Err(AppError::process(format!("operation task failed: {}", e))),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.0.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

/// Clears the busy marker of an instance when dropped.
pub struct BusyGuard {
    slot: Arc<InstanceSlot>,
    events: broadcast::Sender<RuntimeEvent>,
}

impl std::fmt::Debug for BusyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyGuard").finish_non_exhaustive()
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut rt = self.slot.runtime();
        rt.busy = None;
        let state = rt.state;
        self.slot
            .transition(&mut rt, state, RuntimeEventReason::Released, &self.events);
    }
}

#[derive(Clone)]
struct RunningProcess {
    pid: u32,
    generation: u64,
    started_at: DateTime<Utc>,
    started: Instant,
    stdin: Option<Arc<AsyncMutex<ChildStdin>>>,
    exited: watch::Receiver<bool>,
}

#[derive(Default)]
struct SlotRuntime {
    state: InstanceState,
    process: Option<RunningProcess>,
    last_error: Option<String>,
    busy: Option<String>,
    pending_start: Option<AbortHandle>,
    generation: u64,
}

struct InstanceSlot {
    id: String,
    default_dir: PathBuf,
    config: RwLock<InstanceConfig>,
    /// Serializes lifecycle operations on this instance.
    control: Arc<AsyncMutex<()>>,
    runtime: Mutex<SlotRuntime>,
    logs: LogBuffer,
    lease: Mutex<Option<PortLease>>,
}

impl InstanceSlot {
    fn runtime(&self) -> MutexGuard<'_, SlotRuntime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn config(&self) -> InstanceConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn data_dir(&self) -> PathBuf {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .data_dir
            .clone()
            .unwrap_or_else(|| self.default_dir.clone())
    }

    fn take_lease(&self) -> Option<PortLease> {
        self.lease.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn transition(
        &self,
        rt: &mut SlotRuntime,
        to: InstanceState,
        reason: RuntimeEventReason,
        events: &broadcast::Sender<RuntimeEvent>,
    ) {
        let previous = rt.state;
        rt.state = to;
        log::info!(
            "Instance {} {} -> {} ({:?})",
            self.id,
            previous,
            to,
            reason
        );
        let _ = events.send(RuntimeEvent {
            instance_id: self.id.clone(),
            previous,
            state: to,
            reason,
            pid: rt.process.as_ref().map(|p| p.pid),
            at: Utc::now(),
        });
    }

    fn fail_launch(&self, error: &AppError, events: &broadcast::Sender<RuntimeEvent>) {
        let mut rt = self.runtime();
        rt.last_error = Some(error.to_string());
        self.transition(&mut rt, InstanceState::Error, RuntimeEventReason::LaunchFailed, events);
        drop(rt);
        log::error!("Instance {} failed to launch: {}", self.id, error);
    }

    /// Called by the exit watcher once the child has been reaped.
    fn on_exit(&self, generation: u64, code: Option<i32>, events: &broadcast::Sender<RuntimeEvent>) {
        let mut rt = self.runtime();
        if rt.process.as_ref().map(|p| p.generation) != Some(generation) {
            return;
        }
        let described = code.map_or_else(|| "signal".to_string(), |c| format!("code {c}"));
        match rt.state {
            InstanceState::Stopping => {
                self.transition(&mut rt, InstanceState::Stopped, RuntimeEventReason::Exited, events);
                rt.process = None;
            }
            InstanceState::Starting => {
                rt.last_error = Some(format!("process exited during startup ({described})"));
                self.transition(
                    &mut rt,
                    InstanceState::Error,
                    RuntimeEventReason::LaunchFailed,
                    events,
                );
                rt.process = None;
            }
            InstanceState::Running => {
                rt.last_error = Some(format!("process exited unexpectedly ({described})"));
                self.transition(&mut rt, InstanceState::Crashed, RuntimeEventReason::Crashed, events);
                rt.process = None;
                log::error!("Instance {} crashed ({})", self.id, described);
            }
            InstanceState::Stopped | InstanceState::Crashed | InstanceState::Error => {
                rt.process = None;
            }
        }
    }

    /// Called by the readiness task of generation `generation`.
    fn on_readiness(
        &self,
        generation: u64,
        result: Result<()>,
        events: &broadcast::Sender<RuntimeEvent>,
    ) -> Result<()> {
        let mut rt = self.runtime();
        let current = rt
            .process
            .as_ref()
            .filter(|p| p.generation == generation)
            .map(|p| p.pid);
        let Some(pid) = current.filter(|_| rt.state == InstanceState::Starting) else {
            return result.and(Err(AppError::process("start was superseded")));
        };
        rt.pending_start = None;

        match result {
            Ok(()) => {
                self.transition(&mut rt, InstanceState::Running, RuntimeEventReason::Ready, events);
                Ok(())
            }
            Err(e) => {
                rt.last_error = Some(e.to_string());
                self.transition(
                    &mut rt,
                    InstanceState::Error,
                    RuntimeEventReason::ReadinessFailed,
                    events,
                );
                drop(rt);
                log::error!("Instance {} did not become ready: {}", self.id, e);
                if let Err(kill_err) = force_kill(pid) {
                    log::warn!(
                        "Failed to kill unready instance {}: {}",
                        self.id,
                        kill_err
                    );
                }
                Err(e)
            }
        }
    }
}

/// Owns every supervised server process on the host.
pub struct Supervisor {
    slots: RwLock<HashMap<String, Arc<InstanceSlot>>>,
    events: broadcast::Sender<RuntimeEvent>,
    paths: DataPaths,
    settings: HostSettings,
    http_client: Client,
}

impl Supervisor {
    pub fn new(paths: DataPaths, settings: HostSettings) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_millis(settings.probe_timeout_ms))
            .build()
            .map_err(|e| AppError::other(format!("Failed to create HTTP client: {}", e)))?;
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));

        Ok(Self {
            slots: RwLock::new(HashMap::new()),
            events,
            paths,
            settings,
            http_client,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// Add an instance, or replace the config of a known one.
    ///
    /// A replaced config takes effect on the next start.
    pub fn register(&self, instance_id: &str, config: InstanceConfig) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get(instance_id) {
            *slot.config.write().unwrap_or_else(|e| e.into_inner()) = config;
            return;
        }
        let slot = InstanceSlot {
            id: instance_id.to_string(),
            default_dir: self.paths.default_instance_dir(instance_id),
            config: RwLock::new(config),
            control: Arc::new(AsyncMutex::new(())),
            runtime: Mutex::new(SlotRuntime::default()),
            logs: LogBuffer::new(self.settings.log_buffer_lines, self.settings.event_buffer),
            lease: Mutex::new(None),
        };
        slots.insert(instance_id.to_string(), Arc::new(slot));
        drop(slots);
        log::debug!("Registered instance {}", instance_id);
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = slots.keys().cloned().collect();
        drop(slots);
        ids.sort();
        ids
    }

    fn slot(&self, instance_id: &str) -> Result<Arc<InstanceSlot>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .get(instance_id)
            .map(Arc::clone)
            .ok_or_else(|| AppError::instance_not_found(instance_id))
    }

    fn all_slots(&self) -> Vec<Arc<InstanceSlot>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.values().map(Arc::clone).collect()
    }

    pub fn instance_config(&self, instance_id: &str) -> Result<InstanceConfig> {
        Ok(self.slot(instance_id)?.config())
    }

    pub fn data_dir(&self, instance_id: &str) -> Result<PathBuf> {
        Ok(self.slot(instance_id)?.data_dir())
    }

    /// Kill servers recorded in pid files by a previous host process.
    pub fn recover_orphans(&self) -> Vec<(String, u32)> {
        let mut killed = Vec::new();
        for slot in self.all_slots() {
            if let Some(pid) = reap_orphan(&self.paths.pid_file(&slot.id), &slot.id) {
                killed.push((slot.id.clone(), pid));
            }
        }
        killed
    }

    pub fn status(&self, instance_id: &str) -> Result<InstanceStatus> {
        let slot = self.slot(instance_id)?;
        let rt = slot.runtime();
        let status = InstanceStatus {
            instance_id: slot.id.clone(),
            state: rt.state,
            pid: rt.process.as_ref().map(|p| p.pid),
            started_at: rt.process.as_ref().map(|p| p.started_at),
            uptime_ms: rt
                .process
                .as_ref()
                .map(|p| p.started.elapsed().as_millis() as u64),
            last_error: rt.last_error.clone(),
            busy: rt.busy.clone(),
        };
        drop(rt);
        Ok(status)
    }

    pub fn statuses(&self) -> Vec<InstanceStatus> {
        self.instance_ids()
            .iter()
            .filter_map(|id| self.status(id).ok())
            .collect()
    }

    /// Recent console lines plus a stream continuing right after them.
    pub fn logs(&self, instance_id: &str) -> Result<(Vec<LogLine>, broadcast::Receiver<LogLine>)> {
        Ok(self.slot(instance_id)?.logs.subscribe())
    }

    /// Start the instance. The returned [`Pending`] resolves once it is ready.
    pub async fn start(&self, instance_id: &str) -> Result<Pending> {
        let slot = self.slot(instance_id)?;
        let _guard = slot.control.lock().await;
        let ready = self.spawn_locked(&slot).await?;
        Ok(Pending::task(ready))
    }

    /// Stop the instance. Stopping a stopped instance is a no-op.
    pub async fn stop(&self, instance_id: &str, options: StopOptions) -> Result<Pending> {
        let slot = self.slot(instance_id)?;
        let guard = Arc::clone(&slot.control).lock_owned().await;
        if slot.runtime().process.is_none() {
            return Ok(Pending::done());
        }

        let events = self.events.clone();
        let grace = Duration::from_secs(self.settings.stop_timeout_secs);
        Ok(Pending::task(tokio::spawn(async move {
            let result = stop_locked(&slot, options, &events, grace).await;
            drop(guard);
            result
        })))
    }

    /// Stop then start without letting other operations interleave.
    pub async fn restart(self: &Arc<Self>, instance_id: &str) -> Result<Pending> {
        let slot = self.slot(instance_id)?;
        let guard = Arc::clone(&slot.control).lock_owned().await;
        let this = Arc::clone(self);
        Ok(Pending::task(tokio::spawn(async move {
            let grace = Duration::from_secs(this.settings.stop_timeout_secs);
            stop_locked(&slot, StopOptions::graceful(), &this.events, grace).await?;
            let ready = this.spawn_locked(&slot).await;
            drop(guard);
            match ready?.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(AppError::process("operation was cancelled")),
                Err(e) => Err(AppError::process(format!("operation task failed: {}", e))),
            }
        })))
    }

    /// Write one console line to the server's stdin.
    pub async fn send_command(&self, instance_id: &str, command: &str) -> Result<()> {
        let slot = self.slot(instance_id)?;
        let _guard = slot.control.lock().await;
        let stdin = {
            let rt = slot.runtime();
            if rt.state != InstanceState::Running {
                return Err(AppError::not_running(instance_id));
            }
            rt.process.as_ref().and_then(|p| p.stdin.clone())
        };
        let stdin = stdin.ok_or_else(|| AppError::process("stdin is not available"))?;
        write_line(&stdin, command).await?;
        slot.logs.push(LogStream::Host, format!("> {}", command));
        log::info!("Sent command to instance {}: {}", instance_id, command);
        Ok(())
    }

    /// Move a crashed or failed instance back to stopped.
    pub async fn reset(&self, instance_id: &str) -> Result<InstanceState> {
        let slot = self.slot(instance_id)?;
        let _guard = slot.control.lock().await;
        let mut rt = slot.runtime();
        if rt.process.is_none() && matches!(rt.state, InstanceState::Crashed | InstanceState::Error)
        {
            slot.transition(
                &mut rt,
                InstanceState::Stopped,
                RuntimeEventReason::Reset,
                &self.events,
            );
        }
        let state = rt.state;
        drop(rt);
        Ok(state)
    }

    /// Block starts and port leases while `reason` owns the data directory.
    ///
    /// A running instance is refused unless `stop` is given, in which case it
    /// is stopped and marked under the same control lock.
    pub async fn hold(
        &self,
        instance_id: &str,
        reason: &str,
        stop: Option<StopOptions>,
    ) -> Result<BusyGuard> {
        let slot = self.slot(instance_id)?;
        let _guard = slot.control.lock().await;
        let (running, busy) = {
            let rt = slot.runtime();
            (rt.process.is_some() || rt.state.is_active(), rt.busy.clone())
        };
        if let Some(existing) = busy {
            return Err(AppError::conflict(instance_id, existing));
        }
        if running {
            let Some(options) = stop else {
                return Err(AppError::conflict(instance_id, "instance is running"));
            };
            let grace = Duration::from_secs(self.settings.stop_timeout_secs);
            stop_locked(&slot, options, &self.events, grace).await?;
        }
        if let Some(lease) = slot.take_lease() {
            lease.release().await;
        }

        let mut rt = slot.runtime();
        if rt.process.is_some() {
            return Err(AppError::conflict(instance_id, "instance is running"));
        }
        rt.busy = Some(reason.to_string());
        drop(rt);
        log::debug!("Instance {} held: {}", instance_id, reason);
        Ok(BusyGuard {
            slot: Arc::clone(&slot),
            events: self.events.clone(),
        })
    }

    /// Let a stand-in listener hold the port of a stopped instance.
    ///
    /// The next start revokes the lease and waits for the socket to close.
    pub async fn lease_port(&self, instance_id: &str) -> Result<LeaseHolder> {
        let slot = self.slot(instance_id)?;
        let _guard = slot.control.lock().await;
        let (active, busy) = {
            let rt = slot.runtime();
            (rt.process.is_some() || rt.state.is_active(), rt.busy.clone())
        };
        if active {
            return Err(AppError::instance_running(instance_id));
        }
        if let Some(reason) = busy {
            return Err(AppError::conflict(instance_id, reason));
        }
        let (lease, holder) = port_lease();
        let previous = slot
            .lease
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(lease);
        if let Some(previous) = previous {
            previous.release().await;
        }
        Ok(holder)
    }

    pub fn has_port_lease(&self, instance_id: &str) -> bool {
        let Ok(slot) = self.slot(instance_id) else {
            return false;
        };
        let lease = slot.lease.lock().unwrap_or_else(|e| e.into_inner());
        lease.as_ref().is_some_and(PortLease::is_held)
    }

    /// Gracefully stop every instance in parallel and withdraw all leases.
    pub async fn shutdown(&self) {
        let grace = Duration::from_secs(self.settings.stop_timeout_secs);
        let stops = self.all_slots().into_iter().map(|slot| {
            let events = self.events.clone();
            async move {
                let _guard = slot.control.lock().await;
                drop(slot.take_lease());
                if let Err(e) = stop_locked(&slot, StopOptions::graceful(), &events, grace).await {
                    log::error!("Failed to stop instance {} on shutdown: {}", slot.id, e);
                }
            }
        });
        futures_util::future::join_all(stops).await;
    }

    fn check_port_holders(&self, instance_id: &str, port: u16) -> Result<()> {
        for other in self.all_slots() {
            if other.id == instance_id || other.config().port != port {
                continue;
            }
            if other.runtime().process.is_some() {
                return Err(AppError::port_in_use(port, Some(&other.id)));
            }
        }
        Ok(())
    }

    /// Spawn the server process. Caller holds the control lock.
    async fn spawn_locked(&self, slot: &Arc<InstanceSlot>) -> Result<JoinHandle<Result<()>>> {
        let (active, busy) = {
            let rt = slot.runtime();
            (rt.process.is_some() || rt.state.is_active(), rt.busy.clone())
        };
        if active {
            return Err(AppError::instance_running(&slot.id));
        }
        if let Some(reason) = busy {
            return Err(AppError::conflict(&slot.id, reason));
        }

        let config = slot.config();
        let data_dir = slot.data_dir();

        if let Some(lease) = slot.take_lease() {
            log::debug!("Revoking port lease of instance {}", slot.id);
            lease.release().await;
        }

        let mut child = match self.launch(slot, &config, &data_dir).await {
            Ok(child) => child,
            Err(e) => {
                slot.fail_launch(&e, &self.events);
                return Err(e);
            }
        };
        let Some(pid) = child.id() else {
            let e = AppError::process("Failed to get process ID");
            slot.fail_launch(&e, &self.events);
            return Err(e);
        };

        let pid_file = self.paths.pid_file(&slot.id);
        if let Err(e) = write_pid_file(&pid_file, pid) {
            log::warn!("Failed to record pid of instance {}: {}", slot.id, e);
        }

        let stdin = child.stdin.take().map(|s| Arc::new(AsyncMutex::new(s)));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (exit_tx, exited) = watch::channel(false);
        // Subscribe before the pipe readers exist so no line is missed.
        let readiness_logs = slot.logs.follow();

        let generation = {
            let mut rt = slot.runtime();
            rt.generation += 1;
            let generation = rt.generation;
            rt.process = Some(RunningProcess {
                pid,
                generation,
                started_at: Utc::now(),
                started: Instant::now(),
                stdin,
                exited: exited.clone(),
            });
            rt.last_error = None;
            slot.transition(
                &mut rt,
                InstanceState::Starting,
                RuntimeEventReason::Spawned,
                &self.events,
            );
            generation
        };
        log::info!(
            "Instance {} spawned (pid: {}, port: {})",
            slot.id,
            pid,
            config.port
        );

        if let Some(stdout) = stdout {
            forward_output(Arc::clone(slot), stdout, LogStream::Stdout);
        }
        if let Some(stderr) = stderr {
            forward_output(Arc::clone(slot), stderr, LogStream::Stderr);
        }

        {
            let slot = Arc::clone(slot);
            let events = self.events.clone();
            tokio::spawn(async move {
                let status = child.wait().await;
                let code = status.as_ref().ok().and_then(std::process::ExitStatus::code);
                log::info!(
                    "Instance {} process exited (pid: {}, status: {:?})",
                    slot.id,
                    pid,
                    status
                );
                exit_tx.send_replace(true);
                remove_pid_file(&pid_file);
                slot.on_exit(generation, code, &events);
            });
        }

        let probe = ReadinessProbe {
            port: config.port,
            protocol: config.protocol,
            probe_timeout: Duration::from_millis(self.settings.probe_timeout_ms),
            http_client: self.http_client.clone(),
            logs: readiness_logs,
            exited,
        };
        let timeout = Duration::from_secs(self.settings.start_timeout_secs);
        let ready = {
            let slot = Arc::clone(slot);
            let events = self.events.clone();
            let readiness = config.readiness.clone();
            tokio::spawn(async move {
                let result = wait_ready(&readiness, probe, timeout).await;
                slot.on_readiness(generation, result, &events)
            })
        };

        let mut rt = slot.runtime();
        if rt.process.as_ref().map(|p| p.generation) == Some(generation)
            && rt.state == InstanceState::Starting
        {
            rt.pending_start = Some(ready.abort_handle());
        }
        drop(rt);
        Ok(ready)
    }

    async fn launch(
        &self,
        slot: &InstanceSlot,
        config: &InstanceConfig,
        data_dir: &std::path::Path,
    ) -> Result<tokio::process::Child> {
        self.check_port_holders(&slot.id, config.port)?;
        check_port_available(config.port, config.protocol)?;

        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| AppError::io(format!("Failed to create {}: {}", data_dir.display(), e)))?;
        let program = resolve_executable(&config.command, data_dir)?;
        let args = expand_args(
            &config.args,
            config.port,
            data_dir,
            config.limits.max_memory_mb,
        );

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(data_dir)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        {
            use windows::Win32::System::Threading::CREATE_NO_WINDOW;
            cmd.creation_flags(CREATE_NO_WINDOW.0);
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.spawn()
            .map_err(|e| AppError::launch(&config.command, e.to_string()))
    }
}

/// Stop the running process of `slot`. Caller holds the control lock.
async fn stop_locked(
    slot: &InstanceSlot,
    options: StopOptions,
    events: &broadcast::Sender<RuntimeEvent>,
    grace: Duration,
) -> Result<()> {
    let process = {
        let mut rt = slot.runtime();
        let Some(process) = rt.process.clone() else {
            return Ok(());
        };
        if let Some(pending) = rt.pending_start.take() {
            pending.abort();
        }
        slot.transition(
            &mut rt,
            InstanceState::Stopping,
            RuntimeEventReason::StopRequested,
            events,
        );
        process
    };
    let mut exited = process.exited.clone();

    let mut exited_in_time = false;
    if options.graceful {
        let stop_command = slot.config().stop_command;
        if let Err(e) = request_exit(&process, stop_command.as_deref()).await {
            log::warn!(
                "Graceful stop request for instance {} failed: {}",
                slot.id,
                e
            );
        } else {
            exited_in_time = tokio::time::timeout(grace, exited.wait_for(|done| *done))
                .await
                .is_ok();
        }
        if !exited_in_time {
            log::warn!(
                "Instance {} did not exit within {}s, force killing (pid: {})",
                slot.id,
                grace.as_secs(),
                process.pid
            );
        }
    }

    if !exited_in_time {
        if let Err(e) = force_kill(process.pid) {
            log::warn!("Force kill of instance {} failed: {}", slot.id, e);
        }
        if tokio::time::timeout(KILL_WAIT, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            let error = AppError::timeout("stop", grace.as_secs() + KILL_WAIT.as_secs());
            let mut rt = slot.runtime();
            rt.last_error = Some(error.to_string());
            slot.transition(&mut rt, InstanceState::Error, RuntimeEventReason::Exited, events);
            drop(rt);
            return Err(error);
        }
    }

    // The exit watcher normally completes the transition; cover a lost race.
    let mut rt = slot.runtime();
    if rt.state == InstanceState::Stopping {
        rt.process = None;
        slot.transition(&mut rt, InstanceState::Stopped, RuntimeEventReason::Exited, events);
    }
    drop(rt);
    log::info!("Instance {} stopped (pid: {})", slot.id, process.pid);
    Ok(())
}

async fn request_exit(process: &RunningProcess, stop_command: Option<&str>) -> Result<()> {
    match (stop_command, &process.stdin) {
        (Some(command), Some(stdin)) => write_line(stdin, command).await,
        _ => terminate_signal(process.pid),
    }
}

async fn write_line(stdin: &AsyncMutex<ChildStdin>, line: &str) -> Result<()> {
    let mut stdin = stdin.lock().await;
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    drop(stdin);
    Ok(())
}

/// Copy process output into the log buffer, one line at a time.
fn forward_output<R>(slot: Arc<InstanceSlot>, reader: R, stream: LogStream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    if stream == LogStream::Stderr {
                        log::warn!("[{} stderr] {}", slot.id, line);
                    } else {
                        log::info!("[{} stdout] {}", slot.id, line);
                    }
                    slot.logs.push(stream, line);
                }
                Err(e) => {
                    log::debug!("Output reader of instance {} stopped: {}", slot.id, e);
                    break;
                }
            }
        }
    });
}
