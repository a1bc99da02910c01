use std::time::Duration;

use serde::Deserialize;

use crate::services::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the runner.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Base URL of the inference service; predictions are POSTed to `{url}/predict`.
    pub inference_url: String,

    /// Bearer token for the inference service
    #[serde(default)]
    pub inference_api_token: Option<String>,

    /// Ceiling for a single prediction call
    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    /// Attempts per scan, first call included
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Outstanding predictions per batch (1 = sequential)
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// How long a settled batch stays queryable before it is evicted
    #[serde(default = "default_batch_retention_secs")]
    pub batch_retention_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_inference_timeout_secs() -> u64 {
    30
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    8000
}

fn default_max_in_flight() -> usize {
    1
}

fn default_batch_retention_secs() -> u64 {
    3600
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn batch_retention(&self) -> Duration {
        Duration::from_secs(self.batch_retention_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}
