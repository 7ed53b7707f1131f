//! Typed configuration.
//!
//! Sources, later wins: built-in defaults -> TOML file -> `COURIER_*`
//! environment variables. Validated once at startup; fails fast.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::retry::RetryPolicy;
use crate::domain::ContentType;

const ENV_PREFIX: &str = "COURIER_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// When a leased message is acknowledged relative to its execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Ack after the task body returned (at-least-once execution).
    Late,
    /// Ack right after lease, before execution (at-most-once execution).
    Early,
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "late" => Ok(AckMode::Late),
            "early" | "immediate" => Ok(AckMode::Early),
            other => Err(format!("expected 'late' or 'early', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CourierConfig {
    pub broker_url: String,
    pub result_backend_url: String,
    /// Wire serializer. Only `json` exists.
    pub serializer: String,
    pub accept_content: Vec<String>,

    /// Number of execution slots. Defaults to the host's available parallelism.
    pub concurrency: usize,
    /// Messages a slot may hold leased at once.
    pub prefetch_limit: usize,
    pub ack_mode: AckMode,

    pub result_expires_secs: u64,
    /// Discard (rather than redeliver) messages whose worker was lost.
    pub reject_on_worker_loss: bool,
    /// Redeliveries allowed after worker loss when `reject_on_worker_loss` is off.
    pub max_redeliveries: u32,
    /// Extra in-process attempts after a failed execution.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,

    pub visibility_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub reap_interval_ms: u64,

    pub callback_url: Option<String>,
    pub callback_timeout_secs: u64,

    pub log_level: String,
    /// Directory for the rolling log file. Console only when unset.
    pub log_dir: Option<PathBuf>,
    /// Rotated log files kept in `log_dir`.
    pub log_max_files: usize,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            broker_url: "memory://".to_string(),
            result_backend_url: "memory://".to_string(),
            serializer: "json".to_string(),
            accept_content: vec![ContentType::JSON_MIME.to_string()],
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            prefetch_limit: 1,
            ack_mode: AckMode::Late,
            result_expires_secs: 3600,
            reject_on_worker_loss: true,
            max_redeliveries: 1,
            max_retries: 0,
            retry_base_delay_ms: 1000,
            visibility_timeout_secs: 300,
            poll_interval_ms: 1000,
            reap_interval_ms: 1000,
            callback_url: None,
            callback_timeout_secs: 10,
            log_level: "info".to_string(),
            log_dir: None,
            log_max_files: 5,
        }
    }
}

impl CourierConfig {
    /// Defaults, then `path` (if given), then the process environment; validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `COURIER_<FIELD>` variables found via `lookup`.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("BROKER_URL") {
            self.broker_url = v;
        }
        if let Some(v) = var("RESULT_BACKEND_URL") {
            self.result_backend_url = v;
        }
        if let Some(v) = var("SERIALIZER") {
            self.serializer = v;
        }
        if let Some(v) = var("ACCEPT_CONTENT") {
            self.accept_content = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("CALLBACK_URL") {
            self.callback_url = (!v.trim().is_empty()).then_some(v);
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = var("LOG_DIR") {
            self.log_dir = (!v.trim().is_empty()).then(|| PathBuf::from(v));
        }

        parse_var(&var, "CONCURRENCY", &mut self.concurrency)?;
        parse_var(&var, "PREFETCH_LIMIT", &mut self.prefetch_limit)?;
        parse_var(&var, "ACK_MODE", &mut self.ack_mode)?;
        parse_var(&var, "RESULT_EXPIRES_SECS", &mut self.result_expires_secs)?;
        parse_var(&var, "REJECT_ON_WORKER_LOSS", &mut self.reject_on_worker_loss)?;
        parse_var(&var, "MAX_REDELIVERIES", &mut self.max_redeliveries)?;
        parse_var(&var, "MAX_RETRIES", &mut self.max_retries)?;
        parse_var(&var, "RETRY_BASE_DELAY_MS", &mut self.retry_base_delay_ms)?;
        parse_var(&var, "VISIBILITY_TIMEOUT_SECS", &mut self.visibility_timeout_secs)?;
        parse_var(&var, "POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        parse_var(&var, "REAP_INTERVAL_MS", &mut self.reap_interval_ms)?;
        parse_var(&var, "CALLBACK_TIMEOUT_SECS", &mut self.callback_timeout_secs)?;
        parse_var(&var, "LOG_MAX_FILES", &mut self.log_max_files)?;

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.serializer.eq_ignore_ascii_case("json") {
            return Err(ConfigError::invalid(
                "serializer",
                format!("only 'json' is supported, got '{}'", self.serializer),
            ));
        }
        if self.accept_content.is_empty() {
            return Err(ConfigError::invalid("accept_content", "must not be empty"));
        }
        if let Some(other) = self
            .accept_content()
            .into_iter()
            .find(|ct| *ct != ContentType::Json)
        {
            return Err(ConfigError::invalid(
                "accept_content",
                format!("'{other}' is not a structured JSON type"),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency", "must be at least 1"));
        }
        if self.prefetch_limit == 0 {
            return Err(ConfigError::invalid("prefetch_limit", "must be at least 1"));
        }
        if self.visibility_timeout_secs == 0 {
            return Err(ConfigError::invalid("visibility_timeout_secs", "must be at least 1"));
        }
        if self.poll_interval_ms == 0 || self.reap_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "poll_interval_ms/reap_interval_ms",
                "must be at least 1",
            ));
        }
        if self.callback_timeout_secs == 0 {
            return Err(ConfigError::invalid("callback_timeout_secs", "must be at least 1"));
        }
        if self.log_dir.is_some() && self.log_max_files == 0 {
            return Err(ConfigError::invalid("log_max_files", "must be at least 1"));
        }
        self.parsed_callback_url()?;
        Ok(())
    }

    pub fn parsed_callback_url(&self) -> Result<Option<reqwest::Url>, ConfigError> {
        let Some(raw) = &self.callback_url else {
            return Ok(None);
        };
        let url = reqwest::Url::parse(raw)
            .map_err(|e| ConfigError::invalid("callback_url", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "callback_url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        Ok(Some(url))
    }

    pub fn accept_content(&self) -> Vec<ContentType> {
        self.accept_content
            .iter()
            .map(|s| ContentType::parse(s))
            .collect()
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    pub fn result_expires(&self) -> Duration {
        Duration::from_secs(self.result_expires_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_base_delay_ms))
    }

    /// Backoff for lease and settle calls while the broker is unreachable.
    pub fn broker_backoff(&self) -> RetryPolicy {
        RetryPolicy::reconnect(Duration::from_millis(100), Duration::from_secs(10))
    }
}

fn parse_var<T, F>(var: &F, name: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e: T::Err| {
                ConfigError::invalid(&format!("{ENV_PREFIX}{name}"), e.to_string())
            })?;
    }
    Ok(())
}
