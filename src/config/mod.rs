use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::pacing::{PacingPolicy, RateLimitScope};
use crate::engine::retry::{BackoffPolicy, NotFoundPolicy};
use crate::engine::EngineSettings;
use crate::models::bill::IdentifierFormat;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Local,
    R2,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Gemini API keys, comma-separated. Each key is one rotation slot.
    pub gemini_api_keys: Vec<String>,

    /// Model tiers in fallback order.
    #[serde(default = "default_model_tiers")]
    pub model_tiers: Vec<String>,

    /// Rounds per tier.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Request budget per rolling minute, converted into a minimum call gap.
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,

    /// Fixed minimum gap between calls. Overrides `max_requests_per_minute`.
    pub min_call_gap_ms: Option<u64>,

    #[serde(default = "default_rate_limit_scope")]
    pub rate_limit_scope: RateLimitScope,

    /// Number of images processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,

    /// Exact digit count of a valid consumer bill number.
    #[serde(default = "default_identifier_digits")]
    pub identifier_digits: usize,

    /// What to do when the model explicitly reports that no number is visible.
    #[serde(default)]
    pub not_found_policy: NotFoundPolicy,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_storage_backend")]
    pub storage_backend: StorageBackend,

    #[serde(default = "default_success_dir")]
    pub success_dir: PathBuf,

    #[serde(default = "default_failed_dir")]
    pub failed_dir: PathBuf,

    #[serde(default = "default_pending_dir")]
    pub pending_dir: PathBuf,

    /// R2 bucket name (required when `storage_backend = r2`)
    pub r2_bucket: Option<String>,

    /// R2 endpoint URL
    pub r2_endpoint: Option<String>,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: Option<String>,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: Option<String>,

    /// PostgreSQL connection string. Without it the duplicate registry lives
    /// in memory for the lifetime of the process.
    pub database_url: Option<String>,

    /// Folder scanned by the `bill-extract` binary.
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,

    #[serde(default = "default_pending_retry_interval_secs")]
    pub pending_retry_interval_secs: u64,

    /// Prometheus listener for the worker (e.g., "0.0.0.0:9000").
    pub metrics_addr: Option<String>,
}

fn default_model_tiers() -> Vec<String> {
    vec![
        "gemini-2.5-flash".to_string(),
        "gemini-2.5-flash-lite".to_string(),
    ]
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_requests_per_minute() -> u32 {
    5
}

fn default_rate_limit_scope() -> RateLimitScope {
    RateLimitScope::Global
}

fn default_concurrency() -> usize {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_jitter_ms() -> u64 {
    1000
}

fn default_identifier_digits() -> usize {
    12
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Local
}

fn default_success_dir() -> PathBuf {
    PathBuf::from("./bills/success")
}

fn default_failed_dir() -> PathBuf {
    PathBuf::from("./bills/failed")
}

fn default_pending_dir() -> PathBuf {
    PathBuf::from("./bills/pending")
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("./Images")
}

fn default_pending_retry_interval_secs() -> u64 {
    86_400
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.gemini_api_keys.iter().all(|k| k.trim().is_empty()) {
            return Err(ConfigError::Invalid("GEMINI_API_KEYS is empty".into()));
        }
        if self.model_tiers.is_empty() {
            return Err(ConfigError::Invalid("MODEL_TIERS is empty".into()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("MAX_RETRIES must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("CONCURRENCY must be at least 1".into()));
        }
        if self.min_call_gap_ms.is_none() && self.max_requests_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "MAX_REQUESTS_PER_MINUTE must be at least 1".into(),
            ));
        }
        if self.storage_backend == StorageBackend::R2
            && (self.r2_bucket.is_none()
                || self.r2_endpoint.is_none()
                || self.r2_access_key.is_none()
                || self.r2_secret_key.is_none())
        {
            return Err(ConfigError::Invalid(
                "STORAGE_BACKEND=r2 requires R2_BUCKET, R2_ENDPOINT, R2_ACCESS_KEY and R2_SECRET_KEY"
                    .into(),
            ));
        }
        Ok(())
    }

    /// API keys with blank entries removed.
    pub fn api_keys(&self) -> Vec<String> {
        self.gemini_api_keys
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }

    pub fn pacing_policy(&self) -> PacingPolicy {
        match self.min_call_gap_ms {
            Some(ms) => PacingPolicy::fixed_gap(Duration::from_millis(ms), self.rate_limit_scope),
            None => PacingPolicy::per_window(
                self.max_requests_per_minute,
                Duration::from_secs(60),
                self.rate_limit_scope,
            ),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            model_tiers: self.model_tiers.clone(),
            max_retries: self.max_retries,
            concurrency: self.concurrency,
            pacing: self.pacing_policy(),
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.backoff_base_ms),
                multiplier: self.backoff_multiplier,
                jitter: Duration::from_millis(self.backoff_jitter_ms),
            },
            format: IdentifierFormat {
                digits: self.identifier_digits,
            },
            not_found_policy: self.not_found_policy,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
