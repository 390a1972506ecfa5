//! Process settings, loaded once at startup and passed down explicitly.
//!
//! Settings come from a TOML file and are then overridden from the
//! environment. Nothing in this crate reads configuration from global state;
//! components receive what they need, e.g. a [`QueueConfig`].
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;
use crate::utils::Ticker;
use crate::worker::WorkerBuilder;

/// Name of the queue a URL points at: its last non-empty path segment.
///
/// `None` passes through unchanged, and so does a URL that has no segments
/// at all (`""`, `"///"`).
///
/// ```
/// use batchrun_core::parse_queue_name;
///
/// let url = "https://sqs.us-east-1.amazonaws.com/123456789012/batch-operations";
/// assert_eq!(parse_queue_name(Some(url)), Some("batch-operations"));
/// assert_eq!(parse_queue_name(None), None);
/// ```
pub fn parse_queue_name(queue_url: Option<&str>) -> Option<&str> {
    queue_url?.rsplit('/').find(|segment| !segment.is_empty())
}

/// Errors raised while loading or validating [`Settings`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub polling_interval_ms: u64,
    pub concurrent: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            polling_interval_ms: 1000,
            concurrent: 4,
        }
    }
}

impl WorkerSettings {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub wait_secs: u64,
    pub attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            wait_secs: RetryPolicy::DEFAULT_WAIT.as_secs(),
            attempts: RetryPolicy::DEFAULT_ATTEMPTS,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(self.wait_secs), self.attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    /// An operation `running` for longer than this is considered stranded.
    pub stale_after_secs: u64,
    pub interval_secs: u64,
    pub batch_size: usize,
    /// How often a live run refreshes its record. Must stay below
    /// `stale_after_secs`.
    pub heartbeat_secs: u64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            stale_after_secs: 6 * 60 * 60,
            interval_secs: 60,
            batch_size: 100,
            heartbeat_secs: 60,
        }
    }
}

impl ReaperSettings {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// `compact` or `pretty`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
        }
    }
}

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// URL of the queue jobs go to when no queue is named explicitly.
    pub default_queue_url: Option<String>,
    pub database_url: Option<String>,
    /// Whether this process consumes jobs at all.
    pub process_jobs: bool,
    pub worker: WorkerSettings,
    pub retry: RetrySettings,
    pub reaper: ReaperSettings,
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_queue_url: None,
            database_url: None,
            process_jobs: true,
            worker: WorkerSettings::default(),
            retry: RetrySettings::default(),
            reaper: ReaperSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
const VALID_FORMATS: [&str; 2] = ["compact", "pretty"];

impl Settings {
    pub const ENV_DEFAULT_QUEUE_URL: &'static str = "BATCHRUN_DEFAULT_QUEUE_URL";
    pub const ENV_DATABASE_URL: &'static str = "DATABASE_URL";

    /// Parse and validate settings from TOML text. No environment lookup.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `path`, apply environment overrides, then validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut settings: Settings = toml::from_str(&content)?;
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `path` if given, otherwise start from defaults. Environment
    /// overrides apply either way.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        let mut settings = Settings::default();
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Overlay values returned by `lookup` for the known variable names.
    pub fn apply_overrides<L>(&mut self, lookup: L)
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(Self::ENV_DEFAULT_QUEUE_URL) {
            self.default_queue_url = Some(url);
        }
        if let Some(url) = lookup(Self::ENV_DATABASE_URL) {
            self.database_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.attempts must be at least 1".to_owned(),
            ));
        }
        if self.worker.concurrent == 0 {
            return Err(ConfigError::Invalid(
                "worker.concurrent must be at least 1".to_owned(),
            ));
        }
        if self.reaper.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "reaper.batch_size must be at least 1".to_owned(),
            ));
        }
        if self.reaper.heartbeat_secs == 0
            || self.reaper.heartbeat_secs >= self.reaper.stale_after_secs
        {
            return Err(ConfigError::Invalid(
                "reaper.heartbeat_secs must be at least 1 and below reaper.stale_after_secs"
                    .to_owned(),
            ));
        }
        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }
        if !VALID_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                VALID_FORMATS.join(", ")
            )));
        }
        Ok(())
    }

    /// Worker builder paced, sized and retrying as configured. Callers add
    /// the handler, the spawner and the backend.
    pub fn worker_builder(&self) -> WorkerBuilder<Ticker> {
        WorkerBuilder::new(self.worker.polling_interval())
            .concurrent(self.worker.concurrent)
            .retry_policy(self.retry.policy())
    }

    /// Resolve queue naming once; hand the result to whoever enqueues.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::from_url(self.default_queue_url.as_deref())
    }
}

/// Queue naming resolved at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueConfig {
    default_queue_name: Option<String>,
}

impl QueueConfig {
    pub fn from_url(default_queue_url: Option<&str>) -> Self {
        Self {
            default_queue_name: parse_queue_name(default_queue_url).map(str::to_owned),
        }
    }

    /// Queue used when a job does not name one. May be absent.
    pub fn default_queue_name(&self) -> Option<&str> {
        self.default_queue_name.as_deref()
    }

    /// An explicit queue wins; otherwise fall back to the default.
    pub fn resolve<'a>(&'a self, explicit: Option<&'a str>) -> Option<&'a str> {
        explicit.or(self.default_queue_name())
    }
}
