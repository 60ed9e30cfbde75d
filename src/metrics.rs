//! Resource and player sampling of running instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::StatusProtocol;
use crate::error::Result;
use crate::process::{InstanceState, Supervisor};
use crate::protocol;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub instance_id: String,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub players_online: Option<u32>,
    pub players_max: Option<u32>,
    pub uptime_ms: u64,
    /// Whether the status probe answered.
    pub available: bool,
    pub memory_limit_exceeded: bool,
    pub sampled_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    fn idle(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            cpu_percent: 0.0,
            memory_bytes: 0,
            players_online: None,
            players_max: None,
            uptime_ms: 0,
            available: false,
            memory_limit_exceeded: false,
            sampled_at: Utc::now(),
        }
    }
}

pub struct MetricsCollector {
    supervisor: Arc<Supervisor>,
    system: Arc<Mutex<System>>,
    cache: RwLock<HashMap<String, MetricsSnapshot>>,
    probe_timeout: Duration,
}

impl MetricsCollector {
    pub fn new(supervisor: Arc<Supervisor>, probe_timeout: Duration) -> Self {
        Self {
            supervisor,
            system: Arc::new(Mutex::new(System::new())),
            cache: RwLock::new(HashMap::new()),
            probe_timeout,
        }
    }

    /// Last sampled snapshot, if any.
    pub fn cached(&self, instance_id: &str) -> Option<MetricsSnapshot> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.get(instance_id).cloned()
    }

    /// Sample one instance now.
    ///
    /// A failing status probe yields `available = false` with OS figures intact.
    pub async fn sample(&self, instance_id: &str) -> Result<MetricsSnapshot> {
        let status = self.supervisor.status(instance_id)?;
        let config = self.supervisor.instance_config(instance_id)?;

        let snapshot = match status.pid.filter(|_| status.state == InstanceState::Running) {
            None => MetricsSnapshot::idle(instance_id),
            Some(pid) => {
                let (cpu_percent, memory_bytes) = self.os_usage(pid).await.unwrap_or_default();
                let probed = match config.protocol {
                    StatusProtocol::None => None,
                    protocol => match protocol::probe(protocol, config.port, self.probe_timeout).await {
                        Ok(reply) => Some(reply),
                        Err(e) => {
                            log::debug!("Status probe of instance {} failed: {}", instance_id, e);
                            None
                        }
                    },
                };

                let memory_limit_exceeded = config
                    .limits
                    .max_memory_mb
                    .is_some_and(|limit| memory_bytes > limit.saturating_mul(BYTES_PER_MB));
                if memory_limit_exceeded {
                    log::warn!(
                        "Instance {} uses {} MB, above its limit of {} MB",
                        instance_id,
                        memory_bytes / BYTES_PER_MB,
                        config.limits.max_memory_mb.unwrap_or_default()
                    );
                }

                MetricsSnapshot {
                    instance_id: instance_id.to_string(),
                    cpu_percent,
                    memory_bytes,
                    players_online: probed.as_ref().map(|s| s.players_online),
                    players_max: probed.as_ref().map(|s| s.players_max),
                    uptime_ms: status.uptime_ms.unwrap_or_default(),
                    available: probed.is_some(),
                    memory_limit_exceeded,
                    sampled_at: Utc::now(),
                }
            }
        };

        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_id.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    /// Sample every running instance concurrently.
    pub async fn sample_running(&self) -> Vec<MetricsSnapshot> {
        let running: Vec<String> = self
            .supervisor
            .statuses()
            .into_iter()
            .filter(|s| s.state == InstanceState::Running)
            .map(|s| s.instance_id)
            .collect();
        let samples = running.iter().map(|id| self.sample(id));
        futures_util::future::join_all(samples)
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    /// Refresh the cache for running instances until `shutdown` changes.
    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let sampled = self.sample_running().await;
                    log::trace!("Sampled {} running instances", sampled.len());
                }
            }
        }
    }

    async fn os_usage(&self, pid: u32) -> Option<(f32, u64)> {
        let system = Arc::clone(&self.system);
        tokio::task::spawn_blocking(move || {
            let target = Pid::from_u32(pid);
            let mut system = system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[target]),
                true,
                ProcessRefreshKind::new().with_cpu().with_memory(),
            );
            let usage = system
                .process(target)
                .map(|process| (process.cpu_usage(), process.memory()));
            drop(system);
            usage
        })
        .await
        .ok()
        .flatten()
    }
}
