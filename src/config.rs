use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{glog_debug, Error, Result};

/// Top-level configuration, loaded from `~/.gantry/gantry.toml`.
///
/// Every field has a default so a missing file, or a file that only sets
/// a handful of keys, yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub pools: BTreeMap<String, PoolConfig>,
    pub formula_dir: Option<String>,
    pub worktree_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// 0 disables admission control.
    pub max_concurrent: usize,
    pub auto_convoy: bool,
    pub cross_domain_guard: bool,
    pub attach_retries: u32,
    pub attach_backoff_ms: u64,
    pub admission_poll_ms: u64,
    pub admission_max_backoff_ms: u64,
    pub admission_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            auto_convoy: true,
            cross_domain_guard: true,
            attach_retries: 3,
            attach_backoff_ms: 250,
            admission_poll_ms: 2_000,
            admission_max_backoff_ms: 30_000,
            admission_timeout_secs: 1_800,
        }
    }
}

impl DispatchConfig {
    pub fn attach_backoff(&self) -> Duration {
        Duration::from_millis(self.attach_backoff_ms)
    }

    pub fn admission_poll(&self) -> Duration {
        Duration::from_millis(self.admission_poll_ms)
    }

    pub fn admission_max_backoff(&self) -> Duration {
        Duration::from_millis(self.admission_max_backoff_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub binary: String,
    pub workdir: Option<String>,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            binary: "bd".to_string(),
            workdir: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Prefix for session names and agent item ids.
    pub prefix: String,
    /// Command run inside each worker session.
    pub command: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefix: "gt".to_string(),
            command: "claude".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Upper bound on concurrent liveness probes.
    pub liveness_parallelism: usize,
    /// Id prefix for new convoys. Unset uses the store's default prefix.
    pub convoy_prefix: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            liveness_parallelism: 8,
            convoy_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotifyConfig {
    /// Command used to deliver notifications. `{address}`, `{subject}` and
    /// `{body}` placeholders are substituted per argument. Unset means
    /// notifications are only logged.
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PoolConfig {
    /// Repository workers of this pool branch from.
    pub repo: Option<String>,
    /// Item id prefix accepted by this pool when the cross-domain guard is on.
    pub domain_prefix: Option<String>,
    /// Worker name roster, allocated in order.
    pub names: Vec<String>,
}

/// Default worker roster when a pool does not configure one.
pub const DEFAULT_WORKER_NAMES: &[&str] = &[
    "furiosa", "nux", "slit", "rictus", "capable", "toast", "dag", "cheedo", "valkyrie", "ace",
    "morsov", "keeper", "dasher", "coma", "organic", "scrotus",
];

impl Config {
    pub fn gantry_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".gantry"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::gantry_dir()?.join("gantry.toml"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::gantry_dir()?.join("worktrees")),
        }
    }

    pub fn workers_dir(&self) -> Result<PathBuf> {
        Ok(Self::gantry_dir()?.join("workers"))
    }

    pub fn formula_dir(&self) -> Result<PathBuf> {
        match &self.formula_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::gantry_dir()?.join("formulas")),
        }
    }

    pub fn pool(&self, name: &str) -> PoolConfig {
        self.pools.get(name).cloned().unwrap_or_default()
    }

    /// Domain prefix a pool accepts. Falls back to the pool name itself.
    pub fn pool_domain(&self, name: &str) -> String {
        self.pools
            .get(name)
            .and_then(|p| p.domain_prefix.clone())
            .unwrap_or_else(|| name.to_string())
    }

    pub fn worker_names(&self, pool: &str) -> Vec<String> {
        let names = self.pool(pool).names;
        if names.is_empty() {
            DEFAULT_WORKER_NAMES.iter().map(|s| s.to_string()).collect()
        } else {
            names
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        glog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            glog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        glog_debug!(
            "Config loaded: max_concurrent={} auto_convoy={} pools={}",
            config.dispatch.max_concurrent,
            config.dispatch.auto_convoy,
            config.pools.len()
        );
        Ok(config)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
