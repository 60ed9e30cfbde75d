//! Idle sleep and wake-on-connect.
//!
//! A running instance with sleep enabled is stopped once its player count has
//! been zero for `idle_minutes`. While it is stopped, a stand-in listener holds
//! its port, answers status pings with a "starting" reply and wakes the real
//! server on first contact. The supervisor revokes the listener's port lease
//! before spawning, so the two never listen at the same time.

mod idle;
mod listener;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{ConfigStore, InstanceConfig, SleepConfig, StatusProtocol};
use crate::error::{AppError, ErrorKind, Result};
use crate::metrics::MetricsCollector;
use crate::process::{InstanceState, StopOptions, Supervisor};
use crate::protocol::ServerStatus;
use crate::validation::validate_instance_config;

pub use idle::{observe, ProxyStatus, SleepRuntime};
use listener::{Placeholder, WakeSocket};

#[derive(Debug, Clone, Serialize)]
pub struct SleepStatus {
    pub instance_id: String,
    pub state: InstanceState,
    pub settings: SleepConfig,
    #[serde(flatten)]
    pub runtime: SleepRuntime,
}

pub struct SleepManager {
    supervisor: Arc<Supervisor>,
    metrics: Arc<MetricsCollector>,
    config: Arc<ConfigStore>,
    runtime: Mutex<HashMap<String, SleepRuntime>>,
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Serializes listener bind/drop decisions.
    sync_lock: AsyncMutex<()>,
}

impl SleepManager {
    pub fn new(
        supervisor: Arc<Supervisor>,
        metrics: Arc<MetricsCollector>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            supervisor,
            metrics,
            config,
            runtime: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            sync_lock: AsyncMutex::new(()),
        }
    }

    fn with_runtime<T>(&self, instance_id: &str, f: impl FnOnce(&mut SleepRuntime) -> T) -> T {
        let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        let result = f(runtime.entry(instance_id.to_string()).or_default());
        drop(runtime);
        result
    }

    pub fn status(&self, instance_id: &str) -> Result<SleepStatus> {
        let settings = self.supervisor.instance_config(instance_id)?.sleep;
        let state = self.supervisor.status(instance_id)?.state;
        Ok(SleepStatus {
            instance_id: instance_id.to_string(),
            state,
            settings,
            runtime: self.with_runtime(instance_id, |rt| rt.clone()),
        })
    }

    pub fn get_settings(&self, instance_id: &str) -> Result<SleepConfig> {
        Ok(self.supervisor.instance_config(instance_id)?.sleep)
    }

    /// Persist new sleep settings and apply them to the listener right away.
    pub async fn update_settings(
        self: &Arc<Self>,
        instance_id: &str,
        settings: SleepConfig,
    ) -> Result<SleepStatus> {
        let mut live = self.supervisor.instance_config(instance_id)?;
        live.sleep = settings.clone();
        validate_instance_config(instance_id, &live)?;

        self.config.with_config_mut(|config| {
            let instance = config
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| AppError::instance_not_found(instance_id))?;
            instance.sleep = settings.clone();
            Ok(())
        })?;
        self.supervisor.register(instance_id, live);
        if !settings.enabled {
            self.with_runtime(instance_id, |rt| {
                rt.idle_since = None;
                rt.grace_until = None;
            });
        }
        log::info!(
            "Updated sleep settings of instance {}: enabled={}, idle_minutes={}",
            instance_id,
            settings.enabled,
            settings.idle_minutes
        );

        self.sync(instance_id).await?;
        self.status(instance_id)
    }

    /// Stop a running instance now and leave the wake listener in its place.
    pub async fn sleep_now(self: &Arc<Self>, instance_id: &str) -> Result<()> {
        let config = self.supervisor.instance_config(instance_id)?;
        if !config.sleep.enabled {
            return Err(AppError::config(format!(
                "Sleep is disabled for instance {}",
                instance_id
            )));
        }
        if self.supervisor.status(instance_id)?.state != InstanceState::Running {
            return Err(AppError::not_running(instance_id));
        }
        let claimed = self.with_runtime(instance_id, |rt| {
            !std::mem::replace(&mut rt.stop_in_progress, true)
        });
        if !claimed {
            return Err(AppError::conflict(instance_id, "instance is already going to sleep"));
        }
        log::info!("Putting instance {} to sleep on request", instance_id);
        self.put_to_sleep(instance_id).await
    }

    /// Sample running instances and put idle ones to sleep.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) {
        let checks = self
            .supervisor
            .statuses()
            .into_iter()
            .filter(|status| status.state == InstanceState::Running)
            .map(|status| self.check_idle(status.instance_id, now));
        futures_util::future::join_all(checks).await;
    }

    async fn check_idle(self: &Arc<Self>, instance_id: String, now: DateTime<Utc>) {
        let Ok(config) = self.supervisor.instance_config(&instance_id) else {
            return;
        };
        if !config.sleep.enabled {
            return;
        }
        let players = match self.metrics.sample(&instance_id).await {
            Ok(snapshot) => snapshot.players_online,
            Err(e) => {
                log::debug!("Failed to sample instance {}: {}", instance_id, e);
                None
            }
        };

        let due = self.with_runtime(&instance_id, |rt| observe(rt, &config.sleep, players, now));
        if !due {
            return;
        }
        log::info!(
            "Instance {} has had no players for {} minutes, putting it to sleep",
            instance_id,
            config.sleep.idle_minutes
        );
        if let Err(e) = self.put_to_sleep(&instance_id).await {
            log::warn!("Failed to put instance {} to sleep: {}", instance_id, e);
        }
    }

    /// Stop the instance; the caller has set `stop_in_progress`.
    async fn put_to_sleep(self: &Arc<Self>, instance_id: &str) -> Result<()> {
        let stopped = match self.supervisor.stop(instance_id, StopOptions::graceful()).await {
            Ok(pending) => pending.wait().await,
            Err(e) => Err(e),
        };
        self.with_runtime(instance_id, |rt| rt.stop_in_progress = false);
        stopped?;
        self.sync(instance_id).await
    }

    /// Bind or drop the wake listener to match the instance's current state.
    pub async fn sync(self: &Arc<Self>, instance_id: &str) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        let config = self.supervisor.instance_config(instance_id)?;
        let status = self.supervisor.status(instance_id)?;
        if status.state != InstanceState::Running {
            self.with_runtime(instance_id, SleepRuntime::clear_observations);
        }

        let wanted = config.sleep.enabled
            && config.sleep.wake_on_ping
            && config.protocol != StatusProtocol::None
            && status.state == InstanceState::Stopped
            && status.busy.is_none();
        let active = self.listener_active(instance_id);
        if wanted && !active {
            match self.bind_listener(instance_id, &config).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Conflict => {
                    log::debug!("Not binding wake listener of instance {}: {}", instance_id, e);
                }
                Err(e) => return Err(e),
            }
        } else if !wanted && active {
            self.drop_listener(instance_id).await;
        }
        Ok(())
    }

    pub async fn sync_all(self: &Arc<Self>) {
        for instance_id in self.supervisor.instance_ids() {
            if let Err(e) = self.sync(&instance_id).await {
                log::warn!("Failed to sync wake listener of instance {}: {}", instance_id, e);
            }
        }
    }

    /// A listener counts as active while its task runs and its lease is held.
    fn listener_active(&self, instance_id: &str) -> bool {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let running = listeners
            .get(instance_id)
            .is_some_and(|handle| !handle.is_finished());
        drop(listeners);
        running && self.supervisor.has_port_lease(instance_id)
    }

    async fn bind_listener(self: &Arc<Self>, instance_id: &str, config: &InstanceConfig) -> Result<()> {
        // A listener whose lease was revoked may still be closing its socket.
        self.drop_listener(instance_id).await;
        let holder = self.supervisor.lease_port(instance_id).await?;
        let socket = WakeSocket::bind(config.protocol, config.port).await?;

        let name = if config.name.is_empty() {
            instance_id
        } else {
            config.name.as_str()
        };
        let placeholder = Arc::new(Placeholder {
            status: ServerStatus::starting(name),
            kick_message: format!("{name} is starting up, please reconnect in a moment"),
            port: config.port,
        });

        self.with_runtime(instance_id, |rt| rt.proxy_status = ProxyStatus::Idle);
        let this = Arc::clone(self);
        let id = instance_id.to_string();
        let task = tokio::spawn(async move {
            let waker = Arc::clone(&this);
            let wake_id = id.clone();
            let ack = socket
                .serve(holder, placeholder, move || waker.trigger_wake(&wake_id))
                .await;
            this.with_runtime(&id, |rt| rt.proxy_status = ProxyStatus::Disabled);
            log::info!("Wake listener of instance {} released its port", id);
            if let Some(ack) = ack {
                ack.confirm();
            }
        });
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_id.to_string(), task);

        log::info!(
            "Instance {} is asleep, wake listener bound on port {}",
            instance_id,
            config.port
        );
        Ok(())
    }

    /// Abort the listener task and wait until its socket is closed.
    async fn drop_listener(&self, instance_id: &str) {
        let handle = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_id);
        if let Some(handle) = handle {
            let was_running = !handle.is_finished();
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    log::warn!("Wake listener of instance {} failed: {}", instance_id, e);
                }
            }
            if was_running {
                log::info!("Wake listener of instance {} disabled", instance_id);
            }
        }
        self.with_runtime(instance_id, |rt| rt.proxy_status = ProxyStatus::Disabled);
    }

    /// Start the instance on behalf of an inbound client, once per wake.
    fn trigger_wake(self: &Arc<Self>, instance_id: &str) {
        let now = Utc::now();
        let first = self.with_runtime(instance_id, |rt| {
            rt.last_activity_at = Some(now);
            if rt.start_in_progress {
                return false;
            }
            rt.start_in_progress = true;
            rt.last_wake_error = None;
            true
        });
        if !first {
            return;
        }

        log::info!("Inbound connection to sleeping instance {}, waking it", instance_id);
        let this = Arc::clone(self);
        let id = instance_id.to_string();
        tokio::spawn(async move { this.wake(&id).await });
    }

    async fn wake(self: &Arc<Self>, instance_id: &str) {
        let grace = self
            .supervisor
            .instance_config(instance_id)
            .map(|config| config.sleep.wake_grace_seconds)
            .unwrap_or_default();
        let started = match self.supervisor.start(instance_id).await {
            Ok(pending) => pending.wait().await,
            Err(e) => Err(e),
        };

        match started {
            Ok(()) => {
                self.with_runtime(instance_id, |rt| {
                    rt.start_in_progress = false;
                    rt.woke(Utc::now(), grace);
                });
                log::info!("Instance {} woke up", instance_id);
            }
            Err(e) => {
                log::warn!("Failed to wake instance {}: {}", instance_id, e);
                self.with_runtime(instance_id, |rt| {
                    rt.start_in_progress = false;
                    rt.last_wake_error = Some(e.to_string());
                });
                if let Err(e) = self.supervisor.reset(instance_id).await {
                    log::warn!("Failed to reset instance {}: {}", instance_id, e);
                }
                if let Err(e) = self.sync(instance_id).await {
                    log::warn!("Failed to rebind wake listener of instance {}: {}", instance_id, e);
                }
            }
        }
    }

    /// Run idle scans and follow lifecycle events until `shutdown` changes.
    pub async fn run(self: Arc<Self>, scan_every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.supervisor.subscribe_events();
        let mut scan = tokio::time::interval(scan_every);
        scan.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Ok(event) if event.state == InstanceState::Stopped => {
                        if let Err(e) = self.sync(&event.instance_id).await {
                            log::warn!(
                                "Failed to sync wake listener of instance {}: {}",
                                event.instance_id,
                                e
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("Sleep manager skipped {} runtime events", skipped);
                        self.sync_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = scan.tick() => self.tick(Utc::now()).await,
            }
        }
    }

    /// Close every wake listener.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.keys().cloned().collect()
        };
        for instance_id in ids {
            self.drop_listener(&instance_id).await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use chrono::TimeDelta;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::config::{AppConfig, HostSettings, Readiness};
    use crate::paths::DataPaths;
    use crate::process::{check_port_available, RuntimeEvent, RuntimeEventReason};
    use crate::protocol::java;

    struct Fixture {
        _dir: tempfile::TempDir,
        supervisor: Arc<Supervisor>,
        store: Arc<ConfigStore>,
        manager: Arc<SleepManager>,
    }

    fn sleepy_instance(port: u16, command: &str, args: &[&str]) -> InstanceConfig {
        InstanceConfig {
            name: "Survival".to_string(),
            data_dir: None,
            command: command.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            env: Default::default(),
            port,
            protocol: StatusProtocol::Java,
            stop_command: None,
            readiness: Readiness::Immediate,
            limits: Default::default(),
            sleep: SleepConfig {
                enabled: true,
                idle_minutes: 15,
                wake_grace_seconds: 60,
                wake_on_ping: true,
            },
            backup: Default::default(),
        }
    }

    fn fixture(config: InstanceConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        let settings = HostSettings {
            stop_timeout_secs: 5,
            probe_timeout_ms: 500,
            ..HostSettings::default()
        };
        let supervisor = Arc::new(Supervisor::new(paths.clone(), settings).unwrap());
        supervisor.register("srv1", config.clone());

        let mut app = AppConfig::default();
        app.instances.insert("srv1".to_string(), config);
        let store = Arc::new(ConfigStore::from_config(paths.config_path(), app));
        let metrics = Arc::new(MetricsCollector::new(
            Arc::clone(&supervisor),
            Duration::from_millis(500),
        ));
        let manager = Arc::new(SleepManager::new(
            Arc::clone(&supervisor),
            metrics,
            Arc::clone(&store),
        ));
        Fixture {
            _dir: dir,
            supervisor,
            store,
            manager,
        }
    }

    async fn fake_java_server(port: u16, players: u32) -> JoinHandle<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await.unwrap();
        let status = ServerStatus {
            version_name: "1.21.1".to_string(),
            protocol_version: 767,
            players_online: players,
            players_max: 20,
            motd: "A Minecraft Server".to_string(),
        };
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = java::serve_placeholder(&mut stream, &status, "").await;
            }
        })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(condition(), "condition not reached within 10s");
    }

    fn drain(events: &mut broadcast::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn idle_instance_is_stopped_once_and_listener_takes_port() {
        let port = portpicker::pick_unused_port().unwrap();
        let f = fixture(sleepy_instance(port, "sleep", &["30"]));
        f.supervisor.start("srv1").await.unwrap().wait().await.unwrap();
        let mut events = f.supervisor.subscribe_events();

        let server = fake_java_server(port, 0).await;
        let t0 = Utc::now();
        f.manager.tick(t0).await;
        let status = f.manager.status("srv1").unwrap();
        assert_eq!(status.runtime.players_online, Some(0));
        assert_eq!(status.runtime.idle_since, Some(t0));

        f.manager.tick(t0 + TimeDelta::minutes(10)).await;
        assert_eq!(f.supervisor.status("srv1").unwrap().state, InstanceState::Running);

        // The probe now fails; the last known count of zero still applies.
        server.abort();
        let _ = server.await;
        f.manager.tick(t0 + TimeDelta::minutes(16)).await;
        f.manager.tick(t0 + TimeDelta::minutes(17)).await;

        let stops = drain(&mut events)
            .into_iter()
            .filter(|event| event.state == InstanceState::Stopping)
            .count();
        assert_eq!(stops, 1);
        assert_eq!(f.supervisor.status("srv1").unwrap().state, InstanceState::Stopped);

        let status = f.manager.status("srv1").unwrap();
        assert_eq!(status.runtime.proxy_status, ProxyStatus::Idle);
        assert!(!status.runtime.stop_in_progress);
        assert!(f.supervisor.has_port_lease("srv1"));

        f.manager.shutdown().await;
        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn connecting_clients_wake_the_instance_once() {
        let port = portpicker::pick_unused_port().unwrap();
        let f = fixture(sleepy_instance(port, "sleep", &["30"]));
        let mut events = f.supervisor.subscribe_events();

        f.manager.sync("srv1").await.unwrap();
        assert_eq!(
            f.manager.status("srv1").unwrap().runtime.proxy_status,
            ProxyStatus::Idle
        );

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let (a, b, c) = tokio::join!(
            TcpStream::connect(addr),
            TcpStream::connect(addr),
            TcpStream::connect(addr)
        );
        let mut clients = [a.unwrap(), b.unwrap(), c.unwrap()];
        let replies = futures_util::future::join_all(
            clients
                .iter_mut()
                .map(|client| java::request_status(client, addr)),
        )
        .await;
        for reply in replies {
            let status = reply.unwrap();
            assert!(status.motd.contains("Survival is starting"));
            assert_eq!(status.version_name, "Starting");
        }
        drop(clients);

        let manager = Arc::clone(&f.manager);
        wait_until(move || {
            manager.status("srv1").is_ok_and(|status| {
                status.state == InstanceState::Running && !status.runtime.start_in_progress
            })
        })
        .await;

        let spawned = drain(&mut events)
            .into_iter()
            .filter(|event| event.reason == RuntimeEventReason::Spawned)
            .count();
        assert_eq!(spawned, 1);

        let status = f.manager.status("srv1").unwrap();
        assert_eq!(status.runtime.proxy_status, ProxyStatus::Disabled);
        assert!(status.runtime.grace_until.is_some());
        assert!(status.runtime.last_wake_error.is_none());
        assert!(!f.supervisor.has_port_lease("srv1"));
        assert!(check_port_available(port, StatusProtocol::Java).is_ok());

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn failed_wake_is_reported_and_listener_rebinds() {
        let port = portpicker::pick_unused_port().unwrap();
        let f = fixture(sleepy_instance(port, "/nonexistent/gamehost-server", &[]));
        f.manager.sync("srv1").await.unwrap();

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let reply = java::query_status(addr).await.unwrap();
        assert!(reply.motd.contains("starting"));

        let (manager, supervisor) = (Arc::clone(&f.manager), Arc::clone(&f.supervisor));
        wait_until(move || {
            manager.status("srv1").is_ok_and(|status| {
                status.runtime.last_wake_error.is_some()
                    && status.runtime.proxy_status == ProxyStatus::Idle
                    && supervisor.has_port_lease("srv1")
            })
        })
        .await;

        let status = f.manager.status("srv1").unwrap();
        assert_eq!(status.state, InstanceState::Stopped);
        assert!(!status.runtime.start_in_progress);

        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn sleep_now_requires_sleep_enabled() {
        let port = portpicker::pick_unused_port().unwrap();
        let mut config = sleepy_instance(port, "sleep", &["30"]);
        config.sleep.enabled = false;
        let f = fixture(config);

        let err = f.manager.sleep_now("srv1").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[tokio::test]
    async fn settings_update_persists_and_binds_listener() {
        let port = portpicker::pick_unused_port().unwrap();
        let mut config = sleepy_instance(port, "sleep", &["30"]);
        config.sleep.enabled = false;
        let f = fixture(config);

        let settings = SleepConfig {
            enabled: true,
            idle_minutes: 30,
            ..SleepConfig::default()
        };
        let status = f.manager.update_settings("srv1", settings).await.unwrap();
        assert_eq!(status.runtime.proxy_status, ProxyStatus::Idle);
        assert_eq!(f.store.instance("srv1").unwrap().sleep.idle_minutes, 30);
        assert_eq!(f.manager.get_settings("srv1").unwrap().idle_minutes, 30);

        let disabled = SleepConfig {
            enabled: false,
            ..SleepConfig::default()
        };
        let status = f.manager.update_settings("srv1", disabled).await.unwrap();
        assert_eq!(status.runtime.proxy_status, ProxyStatus::Disabled);
        // The socket is closed by the time the update returns.
        assert!(check_port_available(port, StatusProtocol::Java).is_ok());
        std::net::TcpListener::bind(("0.0.0.0", port)).unwrap();
    }

    #[tokio::test]
    async fn held_instance_gets_no_listener_until_released() {
        let port = portpicker::pick_unused_port().unwrap();
        let f = fixture(sleepy_instance(port, "sleep", &["30"]));
        f.supervisor.start("srv1").await.unwrap().wait().await.unwrap();
        let (shutdown, signal) = watch::channel(false);
        let runner = tokio::spawn(Arc::clone(&f.manager).run(Duration::from_secs(3600), signal));

        let busy = f
            .supervisor
            .hold("srv1", "restore in progress", Some(StopOptions::graceful()))
            .await
            .unwrap();
        f.manager.sync("srv1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!f.supervisor.has_port_lease("srv1"));
        assert_eq!(
            f.manager.status("srv1").unwrap().runtime.proxy_status,
            ProxyStatus::Disabled
        );
        assert!(check_port_available(port, StatusProtocol::Java).is_ok());

        drop(busy);
        let supervisor = Arc::clone(&f.supervisor);
        wait_until(move || supervisor.has_port_lease("srv1")).await;

        let _ = shutdown.send(true);
        runner.await.unwrap();
        f.manager.shutdown().await;
        assert!(check_port_available(port, StatusProtocol::Java).is_ok());
    }

    #[tokio::test]
    async fn sleep_needs_a_status_protocol() {
        let port = portpicker::pick_unused_port().unwrap();
        let mut config = sleepy_instance(port, "sleep", &["30"]);
        config.sleep.enabled = false;
        config.protocol = StatusProtocol::None;
        let f = fixture(config);

        let err = f
            .manager
            .update_settings("srv1", SleepConfig {
                enabled: true,
                ..SleepConfig::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert!(!f.store.instance("srv1").unwrap().sleep.enabled);
    }
}
