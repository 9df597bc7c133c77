//! Reporter configuration.
//!
//! Settings are passed explicitly into the managers; nothing here is global.
//! Values come from defaults, a JSON file, or `IR_*` environment variables.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_REPORT_BYTES: usize = 16 * 1024;
const DEFAULT_CONFIRMATIONS: u64 = 3;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_CONFIRMATION_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_PAD_BLOCK: usize = 256;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    /// Filesystem failure.
    Io(String),
    #[error("config parse error: {0}")]
    /// JSON or environment value could not be parsed.
    Parse(String),
    #[error("invalid config: {0}")]
    /// A value is outside its permitted range.
    Invalid(String),
}

/// Settings shared by submission and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Ledger endpoint handed to the ledger client binding.
    pub ledger_endpoint: String,
    /// Address of the report contract on the ledger.
    pub contract_address: String,
    /// Relayer account label the ledger client signs with. Never the author.
    pub relayer_account: String,
    /// Largest accepted narrative, in bytes.
    pub max_report_bytes: usize,
    /// Confirmations required before a submission counts as final.
    pub required_confirmations: u64,
    /// Delay between receipt polls.
    pub poll_interval_ms: u64,
    /// Deadline for a submission to reach finality.
    pub confirmation_timeout_ms: u64,
    /// Plaintext is padded to a multiple of this many bytes.
    pub pad_block: usize,
    /// Backoff policy for transient ledger failures.
    pub retry: RetryPolicy,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            ledger_endpoint: "file://incident_ledger.json".to_string(),
            contract_address: String::new(),
            relayer_account: "relayer".to_string(),
            max_report_bytes: DEFAULT_MAX_REPORT_BYTES,
            required_confirmations: DEFAULT_CONFIRMATIONS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            confirmation_timeout_ms: DEFAULT_CONFIRMATION_TIMEOUT_MS,
            pad_block: DEFAULT_PAD_BLOCK,
            retry: RetryPolicy::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Parse(format!("{name}={value}"))),
        Err(_) => Ok(None),
    }
}

impl ReporterConfig {
    /// Defaults overridden by any `IR_*` environment variables present.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Overrides fields from `IR_*` environment variables.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(value) = env::var("IR_LEDGER_ENDPOINT") {
            self.ledger_endpoint = value;
        }
        if let Ok(value) = env::var("IR_CONTRACT_ADDRESS") {
            self.contract_address = value;
        }
        if let Ok(value) = env::var("IR_RELAYER_ACCOUNT") {
            self.relayer_account = value;
        }
        if let Some(value) = env_parse("IR_MAX_REPORT_BYTES")? {
            self.max_report_bytes = value;
        }
        if let Some(value) = env_parse("IR_CONFIRMATIONS")? {
            self.required_confirmations = value;
        }
        if let Some(value) = env_parse("IR_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = value;
        }
        if let Some(value) = env_parse("IR_CONFIRMATION_TIMEOUT_MS")? {
            self.confirmation_timeout_ms = value;
        }
        if let Some(value) = env_parse("IR_MAX_RETRIES")? {
            self.retry.max_retries = value;
        }
        if let Some(value) = env_parse("IR_INITIAL_BACKOFF_MS")? {
            self.retry.initial_backoff_ms = value;
        }
        if let Some(value) = env_parse("IR_MAX_BACKOFF_MS")? {
            self.retry.max_backoff_ms = value;
        }
        self.validate()?;
        Ok(self)
    }

    /// Loads a JSON configuration file; missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| ConfigError::Io(err.to_string()))?;
        }
        let data =
            serde_json::to_vec_pretty(self).map_err(|err| ConfigError::Parse(err.to_string()))?;
        fs::write(path, data).map_err(|err| ConfigError::Io(err.to_string()))
    }

    /// Rejects settings the managers cannot operate under.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_report_bytes == 0 {
            return Err(ConfigError::Invalid("max_report_bytes must be positive".into()));
        }
        if self.pad_block == 0 {
            return Err(ConfigError::Invalid("pad_block must be positive".into()));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1.0".into()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Delay between receipt polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Deadline for reaching finality.
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }
}
