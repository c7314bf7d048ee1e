use std::path::PathBuf;
use std::time::Duration;

use common::{QueueConfig, StorageConfig};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use worker::WorkerConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct EventLogConfig {
    /// JSON-lines journal of the event log. Default: "./data/events.jsonl".
    #[serde(default = "default_event_log_path")]
    pub path: PathBuf,
}

fn default_event_log_path() -> PathBuf {
    "./data/events.jsonl".into()
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: default_event_log_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Local,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,
    /// Journal directory of the local ledger. Default: "./data/ledger".
    #[serde(default = "default_ledger_dir")]
    pub dir: PathBuf,
    /// Connection string of the postgres ledger.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_ledger_dir() -> PathBuf {
    "./data/ledger".into()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Local,
            dir: default_ledger_dir(),
            url: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Tenant recorded in every job id. Default: "default".
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Delay between routing passes. Default: 1000.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Events read per projection batch. Default: 500.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_tenant() -> String {
    "default".into()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_batch_size() -> usize {
    500
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tenant: default_tenant(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SweeperConfig {
    /// Executing jobs older than this are failed. Default: 600.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Default: 60.
    #[serde(default = "default_sweep_interval_secs")]
    pub scan_interval_secs: u64,
}

fn default_stale_after_secs() -> u64 {
    600
}
fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            scan_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecycleBinConfig {
    /// How long blobs of deleted descriptors are kept. Default: 7 days.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Default: 3600.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

fn default_retention_secs() -> u64 {
    7 * 24 * 3600
}
fn default_purge_interval_secs() -> u64 {
    3600
}

impl RecycleBinConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.retention_secs).unwrap_or(i64::MAX))
    }
}

impl Default for RecycleBinConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    /// Interval of the duplicate descriptor scan. Default: 300.
    #[serde(default = "default_dedup_interval_secs")]
    pub scan_interval_secs: u64,
}

fn default_dedup_interval_secs() -> u64 {
    300
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_dedup_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
    /// Projection checkpoints live in `{data_dir}/projections`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub recycle_bin: RecycleBinConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

fn default_data_dir() -> PathBuf {
    "./data".into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            event_log: EventLogConfig::default(),
            data_dir: default_data_dir(),
            ledger: LedgerConfig::default(),
            pipeline: PipelineConfig::default(),
            sweeper: SweeperConfig::default(),
            recycle_bin: RecycleBinConfig::default(),
            dedup: DedupConfig::default(),
            queues: Vec::new(),
            workers: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("DOCSTORE_CONFIG").unwrap_or_else(|_| "config/docstore".into());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            // Override from environment (e.g., DOCSTORE__LEDGER__URL)
            .add_source(Environment::with_prefix("DOCSTORE").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn projections_dir(&self) -> PathBuf {
        self.data_dir.join("projections")
    }
}
