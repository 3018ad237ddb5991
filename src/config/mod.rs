use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::dispatcher::DispatchSettings;
use crate::services::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// JSON batch file with the job descriptors
    pub jobs_file: PathBuf,

    /// Provider key: kie, dalle, sdxl or gemini
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Maximum jobs holding non-terminal state at once
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Run one job at a time regardless of `max_workers`
    #[serde(default)]
    pub sequential: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-job timeout, measured from submission
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,

    #[serde(default = "default_rate_limit_base_delay_ms")]
    pub rate_limit_base_delay_ms: u64,

    #[serde(default = "default_rate_limit_max_delay_ms")]
    pub rate_limit_max_delay_ms: u64,

    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,

    /// Stop starting jobs after this many failures in a row (0 disables)
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,

    /// Refuse to start when the provider reports fewer credits than this
    #[serde(default = "default_min_credits")]
    pub min_credits: u64,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Progress server bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_serve_progress")]
    pub serve_progress: bool,

    /// Kie.ai API key (Nano Banana)
    pub kie_api_key: Option<String>,

    /// imgbb API key, used to publish source images for Kie.ai
    pub imgbb_api_key: Option<String>,

    /// OpenAI API key (DALL-E)
    pub openai_api_key: Option<String>,

    /// Replicate API token (Stable Diffusion XL)
    pub replicate_api_token: Option<String>,

    /// Google Gemini API key
    pub gemini_api_key: Option<String>,

    pub kie_model: Option<String>,
    pub dalle_model: Option<String>,
    pub dalle_size: Option<String>,
    pub sdxl_version: Option<String>,
    pub gemini_model: Option<String>,
}

fn default_provider() -> String {
    "kie".to_string()
}

fn default_max_workers() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_rate_limit_retries() -> u32 {
    3
}

fn default_rate_limit_base_delay_ms() -> u64 {
    1000
}

fn default_rate_limit_max_delay_ms() -> u64 {
    30_000
}

fn default_fetch_retries() -> u32 {
    2
}

fn default_max_consecutive_failures() -> usize {
    5
}

fn default_min_credits() -> u64 {
    50
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results/images")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("results/logs")
}

fn default_bind_addr() -> String {
    "127.0.0.1:8686".to_string()
}

fn default_serve_progress() -> bool {
    true
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("MAX_WORKERS must be at least 1".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("POLL_INTERVAL_MS must be positive".to_string()));
        }
        if self.job_timeout_secs == 0 {
            return Err(ConfigError::Invalid("JOB_TIMEOUT_SECS must be positive".to_string()));
        }
        Ok(())
    }

    /// Pool width after applying sequential mode.
    pub fn effective_workers(&self) -> usize {
        if self.sequential {
            1
        } else {
            self.max_workers
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_workers: self.effective_workers(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_secs(self.job_timeout_secs),
            rate_limit: RetryPolicy::new(
                self.rate_limit_retries,
                Duration::from_millis(self.rate_limit_base_delay_ms),
                Duration::from_millis(self.rate_limit_max_delay_ms),
            ),
            fetch_retry: RetryPolicy::new(
                self.fetch_retries,
                Duration::from_millis(self.rate_limit_base_delay_ms),
                Duration::from_millis(self.rate_limit_max_delay_ms),
            ),
            max_consecutive_failures: self.max_consecutive_failures,
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
