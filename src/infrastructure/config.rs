//! Configuration infrastructure
//!
//! Contains configuration loading and management for the batch engine.
//!
//! Resolution order (later wins):
//! 1. Built-in defaults (`defaults` module)
//! 2. JSON config file in the user config directory
//! 3. Environment overrides: `RESILIENT_BATCH__<SECTION>__<KEY>`

#![allow(clippy::derivable_impls)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
    pub health: HealthConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Per-session loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Write a checkpoint every N processed items
    pub checkpoint_every: u32,

    /// Upper bound for one transform call, duplicate lookup included
    pub transform_timeout_ms: u64,

    /// Upper bound for staging one commit's writes in both stores
    pub commit_timeout_ms: u64,
}

/// Retry/backoff policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (3 → 4 attempts total)
    pub max_retries: u32,

    /// 기본 지연 시간 (밀리초)
    pub base_delay_ms: u64,

    /// 최대 지연 시간 (밀리초)
    pub max_delay_ms: u64,

    /// Symmetric jitter as a fraction of the computed delay
    pub jitter_ratio: f64,
}

/// Adaptive timeout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Number of recent successful durations kept
    pub window_size: usize,
    pub min_secs: f64,
    pub max_secs: f64,
    pub buffer_ratio: f64,
    pub buffer_floor_secs: f64,
    /// Warm the window from stored samples when a run starts
    pub seed_from_history: bool,
}

/// Remote session health probing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Fixed probe timeout, independent of the adaptive timeout
    pub probe_timeout_ms: u64,
}

/// Store locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Batch-processing state (sessions, items, checkpoints, samples)
    pub state_database_url: String,

    /// Authoritative domain database
    pub primary_database_url: String,

    /// Directory for payloads too large to keep in the item row
    pub payload_dir: PathBuf,

    pub max_inline_payload_bytes: usize,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted logs (file output only)
    pub json_format: bool,

    /// Enable console output
    pub console_output: bool,

    /// Enable file output
    pub file_output: bool,

    /// Directory for log files; defaults to `<data dir>/logs`
    pub log_dir: Option<PathBuf>,

    /// Number of log files to keep (older files will be deleted)
    pub max_files: u32,

    /// Module-specific log level filters (e.g., "sqlx": "warn", "reqwest": "info")
    pub module_filters: HashMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            timeout: TimeoutConfig::default(),
            health: HealthConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            checkpoint_every: defaults::CHECKPOINT_EVERY,
            transform_timeout_ms: defaults::TRANSFORM_TIMEOUT_MS,
            commit_timeout_ms: defaults::COMMIT_TIMEOUT_MS,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::MAX_RETRIES,
            base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            jitter_ratio: defaults::RETRY_JITTER_RATIO,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            window_size: defaults::TIMEOUT_WINDOW_SIZE,
            min_secs: defaults::TIMEOUT_MIN_SECS,
            max_secs: defaults::TIMEOUT_MAX_SECS,
            buffer_ratio: defaults::TIMEOUT_BUFFER_RATIO,
            buffer_floor_secs: defaults::TIMEOUT_BUFFER_FLOOR_SECS,
            seed_from_history: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: defaults::HEALTH_PROBE_TIMEOUT_MS,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = ConfigManager::get_app_data_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            state_database_url: sqlite_url(&data_dir.join("database").join("batch_state.db")),
            primary_database_url: sqlite_url(&data_dir.join("database").join("primary.db")),
            payload_dir: data_dir.join("payloads"),
            max_inline_payload_bytes: defaults::MAX_INLINE_PAYLOAD_BYTES,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            log_dir: None,
            max_files: defaults::LOG_MAX_FILES,
            module_filters: {
                let mut filters = HashMap::new();
                filters.insert("sqlx".to_string(), "warn".to_string());
                filters.insert("reqwest".to_string(), "info".to_string());
                filters.insert("hyper".to_string(), "warn".to_string());
                filters.insert("tokio".to_string(), "info".to_string());
                filters
            },
        }
    }
}

fn sqlite_url(path: &Path) -> String {
    format!("sqlite:{}", path.display())
}

impl BatchConfig {
    pub const fn transform_timeout(&self) -> Duration {
        Duration::from_millis(self.transform_timeout_ms)
    }

    pub const fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

impl RetryConfig {
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl HealthConfig {
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl AppConfig {
    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.batch.checkpoint_every == 0 {
            bail!("batch.checkpoint_every must be at least 1");
        }
        if self.batch.transform_timeout_ms == 0 || self.batch.commit_timeout_ms == 0 {
            bail!("batch transform/commit timeouts must be positive");
        }
        if self.timeout.window_size == 0 {
            bail!("timeout.window_size must be at least 1");
        }
        if self.timeout.min_secs <= 0.0 || self.timeout.min_secs > self.timeout.max_secs {
            bail!(
                "timeout bounds invalid: min {}s, max {}s",
                self.timeout.min_secs,
                self.timeout.max_secs
            );
        }
        if !(0.0..1.0).contains(&self.retry.jitter_ratio) {
            bail!("retry.jitter_ratio must be in [0, 1), got {}", self.retry.jitter_ratio);
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!("retry.base_delay_ms exceeds retry.max_delay_ms");
        }
        if self.health.probe_timeout_ms == 0 {
            bail!("health.probe_timeout_ms must be positive");
        }
        Ok(())
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    pub const ENV_PREFIX: &'static str = "RESILIENT_BATCH";

    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("resilient-batch");
        Ok(config_dir)
    }

    /// Get application data directory
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join("resilient-batch");
        Ok(data_dir)
    }

    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join("resilient_batch_config.json");
        Ok(Self { config_path })
    }

    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Write the defaults on first run, then load with overrides applied
    pub async fn initialize_on_first_run(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("🎉 First run detected - writing default configuration");
            self.save_config(&AppConfig::default()).await?;
        }
        self.load_config()
    }

    /// Defaults, then the config file (if present), then environment overrides
    pub fn load_config(&self) -> Result<AppConfig> {
        let defaults = config::Config::try_from(&AppConfig::default())
            .context("Failed to serialize default configuration")?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::File::from(self.config_path.as_path())
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration: {:?}", self.config_path))?;

        let config: AppConfig = settings
            .try_deserialize()
            .context("Configuration has an unexpected shape")?;
        config.validate()?;

        if self.config_path.exists() {
            info!("Loaded configuration from: {:?}", self.config_path);
        } else {
            warn!("⚠️  No configuration file at {:?}, using defaults", self.config_path);
        }
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Get the configuration file path
    pub const fn config_path(&self) -> &PathBuf {
        &self.config_path
    }
}

/// Default configuration values
pub mod defaults {
    /// Checkpoint after every item
    pub const CHECKPOINT_EVERY: u32 = 1;

    pub const TRANSFORM_TIMEOUT_MS: u64 = 30_000;
    pub const COMMIT_TIMEOUT_MS: u64 = 30_000;

    /// 3 retries = 4 attempts total
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_BASE_DELAY_MS: u64 = 1000;
    pub const RETRY_MAX_DELAY_MS: u64 = 30_000;
    /// ±20%
    pub const RETRY_JITTER_RATIO: f64 = 0.2;

    pub const TIMEOUT_WINDOW_SIZE: usize = 10;
    pub const TIMEOUT_MIN_SECS: f64 = 15.0;
    pub const TIMEOUT_MAX_SECS: f64 = 120.0;
    pub const TIMEOUT_BUFFER_RATIO: f64 = 0.2;
    pub const TIMEOUT_BUFFER_FLOOR_SECS: f64 = 5.0;

    pub const HEALTH_PROBE_TIMEOUT_MS: u64 = 5000;

    /// 256 KiB
    pub const MAX_INLINE_PAYLOAD_BYTES: usize = 256 * 1024;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = false;
    pub const LOG_MAX_FILES: u32 = 5;
}
