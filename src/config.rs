use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Number of worker loops in the daemon. One worker drains under the
    /// global lease; more workers each hold their own `worker:N` lease.
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_idle_delay")]
    pub idle_delay_secs: u64,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_lease_grace")]
    pub lease_grace_ms: u64,
    #[serde(default = "default_completed_retention")]
    pub completed_retention_hours: u64,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Custom database location
    pub db_path: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            idle_delay_secs: default_idle_delay(),
            lease_ttl_secs: default_lease_ttl(),
            lease_grace_ms: default_lease_grace(),
            completed_retention_hours: default_completed_retention(),
            conflict_policy: ConflictPolicy::default(),
            db_path: None,
        }
    }
}

fn default_workers() -> u32 {
    1
}
fn default_batch_size() -> u32 {
    20
}
fn default_max_retries() -> u32 {
    3
}
fn default_idle_delay() -> u64 {
    30
}
fn default_lease_ttl() -> u64 {
    300
}
fn default_lease_grace() -> u64 {
    1000
}
fn default_completed_retention() -> u64 {
    24
}

/// Which side wins when both changed the same file since the last sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    RemoteWins,
    LocalWins,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    pub root: PathBuf,
    /// Names starting with this prefix are never synced.
    #[serde(default = "default_hidden_prefix")]
    pub hidden_prefix: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_hidden_prefix() -> String {
    ".".into()
}
fn default_debounce_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Remote directory mirrored into the local root, e.g. `/Apps/treesync`.
    pub root: String,
    #[serde(default)]
    pub app_key: String,
    #[serde(default)]
    pub app_secret: String,
    /// Long-lived refresh token issued for this app
    pub refresh_token: Option<String>,
    /// Custom path for token storage
    pub token_path: Option<PathBuf>,
    #[serde(default = "default_longpoll_timeout")]
    pub longpoll_timeout_secs: u64,
}

fn default_longpoll_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_step_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            inline_threshold: default_inline_threshold(),
            chunk_size: default_chunk_size(),
            max_attempts: default_step_attempts(),
            initial_backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_inline_threshold() -> u64 {
    8 * 1024 * 1024
}
fn default_chunk_size() -> u64 {
    8 * 1024 * 1024
}
fn default_step_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}

impl TransferConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

/// Settings the task queue needs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_retries: u32,
}

/// Settings the lease manager needs.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub grace: Duration,
}

/// Settings the reconciler needs.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub remote_root: String,
    pub hidden_prefix: String,
    pub conflict_policy: ConflictPolicy,
}

/// Settings the worker loop needs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: u32,
    pub idle_delay: Duration,
    pub completed_retention: Duration,
}

impl Config {
    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            max_retries: self.general.max_retries,
        }
    }

    pub fn lease(&self) -> LeaseConfig {
        LeaseConfig {
            ttl: Duration::from_secs(self.general.lease_ttl_secs),
            grace: Duration::from_millis(self.general.lease_grace_ms),
        }
    }

    pub fn reconcile(&self) -> ReconcileConfig {
        ReconcileConfig {
            remote_root: self.remote.root.clone(),
            hidden_prefix: self.local.hidden_prefix.clone(),
            conflict_policy: self.general.conflict_policy,
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.general.batch_size,
            idle_delay: Duration::from_secs(self.general.idle_delay_secs),
            completed_retention: Duration::from_secs(self.general.completed_retention_hours * 3600),
        }
    }
}

/// App credentials baked in at build time (see build.rs).
pub fn builtin_credentials() -> Option<(&'static str, &'static str)> {
    match (
        option_env!("TREESYNC_APP_KEY"),
        option_env!("TREESYNC_APP_SECRET"),
    ) {
        (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => Some((key, secret)),
        _ => None,
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("treesyncd").join("config.toml"))
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    let content = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "Failed to read config file: {}\n\
             See config/treesyncd.example.toml for an example.",
            path.display()
        )
    })?;

    parse_config(&content).with_context(|| format!("Invalid config file: {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;

    if config.remote.app_key.is_empty()
        && let Some((key, secret)) = builtin_credentials()
    {
        config.remote.app_key = key.to_string();
        config.remote.app_secret = secret.to_string();
    }

    if config.remote.app_key.is_empty() {
        anyhow::bail!("remote.app_key must not be empty");
    }
    if !config.remote.root.starts_with('/') {
        anyhow::bail!("remote.root must be an absolute path starting with '/'");
    }
    config.remote.root = crate::util::path::normalize_remote(&config.remote.root);

    if config.general.batch_size == 0 {
        anyhow::bail!("general.batch_size must be at least 1");
    }
    if config.general.max_retries == 0 {
        anyhow::bail!("general.max_retries must be at least 1");
    }
    if config.transfer.chunk_size == 0 {
        anyhow::bail!("transfer.chunk_size must be at least 1");
    }
    if config.general.workers == 0 {
        anyhow::bail!("general.workers must be at least 1");
    }

    Ok(config)
}
