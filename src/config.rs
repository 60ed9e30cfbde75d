use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveFormat;
use crate::error::{AppError, Result};
use crate::validation::validate_instance_config;

/// Cached view of `config.toml` with serialized read-modify-write access.
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    cache: RwLock<Arc<AppConfig>>,
}

impl ConfigStore {
    /// Load the config at `path`, writing a default file if none exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = load_config_from_disk(&path)?;
        for (id, instance) in &config.instances {
            validate_instance_config(id, instance)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            cache: RwLock::new(Arc::new(config)),
        })
    }

    /// Build a store around an in-memory config, persisting to `path` on writes.
    pub fn from_config(path: impl Into<PathBuf>, config: AppConfig) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            cache: RwLock::new(Arc::new(config)),
        }
    }

    pub fn load(&self) -> Arc<AppConfig> {
        let config = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&config)
    }

    pub fn instance(&self, instance_id: &str) -> Result<InstanceConfig> {
        self.load()
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| AppError::instance_not_found(instance_id))
    }

    /// Execute a read-modify-write operation on the config file while holding a lock.
    /// This prevents concurrent modifications from causing data loss.
    pub fn with_config_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut AppConfig) -> Result<T>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut updated = (*self.load()).clone();
        let result = f(&mut updated)?;
        save_config_to_disk(&self.path, &updated)?;

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(updated);

        Ok(result)
    }
}

fn load_config_from_disk(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let config = AppConfig::default();
        save_config_to_disk(path, &config)?;
        return Ok(config);
    }
    let content = fs::read_to_string(path).map_err(|e| AppError::config(e.to_string()))?;
    toml::from_str(&content).map_err(|e| AppError::config(e.to_string()))
}

fn save_config_to_disk(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::config(e.to_string()))?;
    }
    let content = toml::to_string_pretty(config).map_err(|e| AppError::config(e.to_string()))?;
    fs::write(path, content).map_err(|e| AppError::config(e.to_string()))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: HostSettings,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceConfig>,
}

/// Host-wide timings and buffer sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub idle_scan_secs: u64,
    pub task_tick_secs: u64,
    /// How often running instances are sampled into the metrics cache.
    pub metrics_interval_secs: u64,
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub probe_timeout_ms: u64,
    pub log_buffer_lines: usize,
    pub event_buffer: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            idle_scan_secs: 30,
            task_tick_secs: 60,
            metrics_interval_secs: 15,
            start_timeout_secs: 120,
            stop_timeout_secs: 60,
            probe_timeout_ms: 2000,
            log_buffer_lines: 1000,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub name: String,
    /// Working directory of the server; defaults to `instances/<id>` under the data root.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub port: u16,
    #[serde(default)]
    pub protocol: StatusProtocol,
    /// Console command written to stdin for a graceful stop. SIGTERM when unset.
    #[serde(default)]
    pub stop_command: Option<String>,
    #[serde(default)]
    pub readiness: Readiness,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub sleep: SleepConfig,
    #[serde(default)]
    pub backup: BackupSettings,
}

/// Wire protocol used for status probes and synthetic wake replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusProtocol {
    /// Minecraft Java server list ping over TCP.
    #[default]
    Java,
    /// RakNet unconnected ping over UDP.
    Bedrock,
    /// No application-level probe.
    None,
}

/// Condition that moves a started process from `starting` to `running`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Readiness {
    /// A stdout/stderr line contains `pattern`.
    LogPattern { pattern: String },
    /// A TCP connection to the instance port succeeds.
    #[default]
    PortBind,
    /// The status protocol answers a handshake.
    StatusProbe,
    /// `GET http://127.0.0.1:<port><path>` returns a success status.
    HttpHealth { path: String },
    /// Running as soon as the process is spawned.
    Immediate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Exposed to args as `{max_memory_mb}`; RSS above it is reported.
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    pub enabled: bool,
    pub idle_minutes: u64,
    pub wake_grace_seconds: u64,
    pub wake_on_ping: bool,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_minutes: 15,
            wake_grace_seconds: 60,
            wake_on_ping: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub default_format: ArchiveFormat,
    /// Keep at most this many manual backups; snapshots taken before a restore are not counted.
    pub max_backups: Option<usize>,
    /// Console commands sent before archiving a running instance (e.g. `save-off`, `save-all`).
    pub pre_commands: Vec<String>,
    /// Console commands sent after archiving a running instance (e.g. `save-on`).
    pub post_commands: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[settings]
idle_scan_secs = 10

[instances.srv1]
name = "Survival"
command = "java"
args = ["-Xmx{max_memory_mb}M", "-jar", "server.jar", "nogui"]
port = 25565
stop_command = "stop"
readiness = { kind = "log_pattern", pattern = "Done (" }
limits = { max_memory_mb = 4096 }
sleep = { enabled = true, idle_minutes = 15 }
"#;

    #[test]
    fn parses_instance_tables_with_defaults() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.settings.idle_scan_secs, 10);
        assert_eq!(config.settings.task_tick_secs, 60);
        assert_eq!(config.settings.metrics_interval_secs, 15);

        let srv1 = &config.instances["srv1"];
        assert_eq!(srv1.port, 25565);
        assert_eq!(srv1.protocol, StatusProtocol::Java);
        assert_eq!(
            srv1.readiness,
            Readiness::LogPattern {
                pattern: "Done (".to_string()
            }
        );
        assert!(srv1.sleep.enabled);
        assert_eq!(srv1.sleep.wake_grace_seconds, 60);
        assert!(srv1.sleep.wake_on_ping);
        assert_eq!(srv1.backup.default_format, ArchiveFormat::Zip);
    }

    #[test]
    fn with_config_mut_persists_and_refreshes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, SAMPLE).unwrap();

        let store = ConfigStore::open(&path).unwrap();
        store
            .with_config_mut(|config| {
                if let Some(instance) = config.instances.get_mut("srv1") {
                    instance.sleep.idle_minutes = 30;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(store.instance("srv1").unwrap().sleep.idle_minutes, 30);
        let reopened = ConfigStore::open(&path).unwrap();
        assert_eq!(reopened.instance("srv1").unwrap().sleep.idle_minutes, 30);
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let store = ConfigStore::open(&path).unwrap();
        assert!(store.load().instances.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn unknown_instance_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::from_config(dir.path().join("c.toml"), AppConfig::default());
        let err = store.instance("nope").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InstanceNotFound);
    }
}
