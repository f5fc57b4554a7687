//! Operator configuration – reads/writes `~/.vigil/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use vigil_kernel::{TrustConfig, WatchdogConfig};
use vigil_runtime::SupervisorConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSection {
    /// Seconds between liveness writes.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: f64,
    /// Records older than this are stale.
    #[serde(default = "default_max_age")]
    pub max_age_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogSection {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: f64,
    /// Silence tolerated before escalation; divided by the check interval
    /// (rounded up) to get the miss threshold.
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: f64,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustSection {
    #[serde(default = "default_trust_min")]
    pub min: f64,
    #[serde(default = "default_trust_max")]
    pub max: f64,
    #[serde(default = "default_trust_initial")]
    pub initial: f64,
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,
    #[serde(default = "default_escalation_penalty")]
    pub escalation_penalty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSection {
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    /// Files and directories captured by snapshots.
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,
}

/// Persisted operator configuration stored in `~/.vigil/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root for heartbeat, safety-mode, trust, backup and freeze-log files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default)]
    pub trust: TrustSection,
    #[serde(default)]
    pub snapshot: SnapshotSection,
}

fn default_data_dir() -> PathBuf {
    vigil_home(&home_dir()).join("data")
}
fn default_heartbeat_interval() -> f64 {
    2.0
}
fn default_max_age() -> f64 {
    10.0
}
fn default_check_interval() -> f64 {
    5.0
}
fn default_timeout() -> f64 {
    30.0
}
fn default_grace_period() -> f64 {
    5.0
}
fn default_join_timeout() -> f64 {
    10.0
}
fn default_trust_min() -> f64 {
    0.0
}
fn default_trust_max() -> f64 {
    100.0
}
fn default_trust_initial() -> f64 {
    50.0
}
fn default_stats_window() -> usize {
    10
}
fn default_escalation_penalty() -> f64 {
    -10.0
}
fn default_max_snapshots() -> usize {
    50
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            max_age_secs: default_max_age(),
        }
    }
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            timeout_secs: default_timeout(),
            grace_period_secs: default_grace_period(),
            join_timeout_secs: default_join_timeout(),
            pid_file: None,
        }
    }
}

impl Default for TrustSection {
    fn default() -> Self {
        Self {
            min: default_trust_min(),
            max: default_trust_max(),
            initial: default_trust_initial(),
            stats_window: default_stats_window(),
            escalation_penalty: default_escalation_penalty(),
        }
    }
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            max_snapshots: default_max_snapshots(),
            include_paths: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            heartbeat: HeartbeatSection::default(),
            watchdog: WatchdogSection::default(),
            trust: TrustSection::default(),
            snapshot: SnapshotSection::default(),
        }
    }
}

fn secs(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if value <= 0.0 {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("must be positive, got {value}"),
        });
    }
    Duration::try_from_secs_f64(value).map_err(|e| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })
}

impl Config {
    /// Translate into the runtime's configuration, validating durations.
    pub fn to_supervisor_config(&self) -> Result<SupervisorConfig, ConfigError> {
        let check_interval = secs("watchdog.check_interval_secs", self.watchdog.check_interval_secs)?;
        let timeout = secs("watchdog.timeout_secs", self.watchdog.timeout_secs)?;
        let watchdog = WatchdogConfig {
            grace_period: secs("watchdog.grace_period_secs", self.watchdog.grace_period_secs)?,
            join_timeout: secs("watchdog.join_timeout_secs", self.watchdog.join_timeout_secs)?,
            pid_file: self.watchdog.pid_file.clone(),
            ..WatchdogConfig::from_timeout(timeout, check_interval)
        };

        let mut cfg = SupervisorConfig::new(&self.data_dir);
        cfg.heartbeat_interval = secs("heartbeat.interval_secs", self.heartbeat.interval_secs)?;
        cfg.heartbeat_max_age = secs("heartbeat.max_age_secs", self.heartbeat.max_age_secs)?;
        cfg.watchdog = watchdog;
        cfg.trust = TrustConfig {
            min: self.trust.min,
            max: self.trust.max,
            initial: self.trust.initial,
            ..TrustConfig::default()
        };
        cfg.stats_window = self.trust.stats_window.max(1);
        cfg.escalation_penalty = self.trust.escalation_penalty;
        cfg.max_snapshots = self.snapshot.max_snapshots;
        cfg.snapshot_paths = self.snapshot.include_paths.clone();
        Ok(cfg)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Paths
// ─────────────────────────────────────────────────────────────────────────────

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn vigil_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".vigil")
}

/// Return the path to `~/.vigil/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    vigil_home(home).join("config.toml")
}

// ─────────────────────────────────────────────────────────────────────────────
// Load / save
// ─────────────────────────────────────────────────────────────────────────────

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: Config = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `VIGIL_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `VIGIL_DATA_DIR` | `data_dir` |
/// | `VIGIL_CHECK_INTERVAL` | `watchdog.check_interval_secs` |
/// | `VIGIL_TIMEOUT` | `watchdog.timeout_secs` |
/// | `VIGIL_HEARTBEAT_INTERVAL` | `heartbeat.interval_secs` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("VIGIL_DATA_DIR") {
        cfg.data_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("VIGIL_CHECK_INTERVAL")
        && let Ok(secs) = v.parse::<f64>()
    {
        cfg.watchdog.check_interval_secs = secs;
    }
    if let Ok(v) = std::env::var("VIGIL_TIMEOUT")
        && let Ok(secs) = v.parse::<f64>()
    {
        cfg.watchdog.timeout_secs = secs;
    }
    if let Ok(v) = std::env::var("VIGIL_HEARTBEAT_INTERVAL")
        && let Ok(secs) = v.parse::<f64>()
    {
        cfg.heartbeat.interval_secs = secs;
    }
}

/// Save the config to disk, creating `~/.vigil/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
