//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or a
//! numeric var does not parse. Connection strings are wrapped in
//! secrecy::SecretString to keep credentials out of logs.

pub mod secrets;

use crate::engine::{Backoff, PromoterConfig, WorkerConfig};
use crate::error::{Error, Result};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Selects the Redis broker when the `redis` feature is built.
    pub redis_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub worker: WorkerConfig,
    pub promoter: PromoterConfig,
    /// How long the built-in `DEFAULT` handler pretends to work.
    pub simulated_work: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let worker_defaults = WorkerConfig::default();
        let promoter_defaults = PromoterConfig::default();

        let worker = WorkerConfig {
            max_retries: optional_var("JOBQ_MAX_RETRIES")?.unwrap_or(worker_defaults.max_retries),
            backoff: Backoff::new(
                millis_var("JOBQ_BASE_BACKOFF_MS", worker_defaults.backoff.base)?,
                millis_var("JOBQ_MAX_BACKOFF_MS", worker_defaults.backoff.max)?,
            ),
            dequeue_timeout: millis_var("JOBQ_DEQUEUE_TIMEOUT_MS", worker_defaults.dequeue_timeout)?,
            error_pause: millis_var("JOBQ_ERROR_PAUSE_MS", worker_defaults.error_pause)?,
        };
        if worker.max_retries == 0 {
            return Err(Error::Config("JOBQ_MAX_RETRIES must be at least 1".to_string()));
        }

        let promoter = PromoterConfig {
            interval: millis_var("JOBQ_PROMOTE_INTERVAL_MS", promoter_defaults.interval)?,
            batch_size: optional_var("JOBQ_PROMOTE_BATCH")?.unwrap_or(promoter_defaults.batch_size),
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            redis_url: std::env::var("REDIS_URL").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            worker,
            promoter,
            simulated_work: millis_var("JOBQ_SIMULATED_WORK_MS", Duration::from_millis(1_500))?,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("environment variable {name} is malformed: {raw:?}"))),
        Err(_) => Ok(None),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    Ok(optional_var::<u64>(name)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}
