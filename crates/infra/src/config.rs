//! Configuration loading for the job queue and its collaborators.
//!
//! Values come from the process environment and are read once at startup.
//! Anything unset falls back to a default; anything set but unparsable is an
//! error rather than a silent fallback.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const DEV_SIGNING_KEY: &str = "dev-result-signing-key";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Runtime configuration of the job queue, result store and journal engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueueConfig {
    /// Advisory cap, only consulted by the pending-job poller.
    pub max_concurrent: usize,
    pub job_timeout: Duration,
    /// Reserved. Failed jobs are never retried automatically.
    pub retry_attempts: u32,
    /// Reserved. Failed jobs are never retried automatically.
    pub retry_delay: Duration,
    pub result_expiration: Duration,
    pub cleanup_interval: Duration,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub max_result_bytes: u64,
    pub temp_dir: PathBuf,
    pub local_file_retry_delay: Duration,
    /// Rows per journal commit (50..=1000).
    pub journal_chunk_size: usize,
    pub result_store_dir: PathBuf,
    pub result_base_url: String,
    pub result_signing_key: String,
    pub database_url: Option<String>,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            job_timeout: Duration::from_millis(1_800_000),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(5_000),
            result_expiration: Duration::from_millis(86_400_000),
            cleanup_interval: Duration::from_millis(3_600_000),
            poll_interval: Duration::from_millis(5_000),
            shutdown_timeout: Duration::from_millis(30_000),
            max_result_bytes: 50 * 1024 * 1024,
            temp_dir: PathBuf::from("./temp"),
            local_file_retry_delay: Duration::from_millis(60_000),
            journal_chunk_size: 500,
            result_store_dir: PathBuf::from("./storage/job-results"),
            result_base_url: "http://localhost:8080/files".to_string(),
            result_signing_key: DEV_SIGNING_KEY.to_string(),
            database_url: None,
        }
    }
}

pub const MIN_JOURNAL_CHUNK_SIZE: usize = 50;
pub const MAX_JOURNAL_CHUNK_SIZE: usize = 1000;

impl JobQueueConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let result_signing_key = match get("RESULT_SIGNING_KEY") {
            Some(key) => key,
            None => {
                tracing::warn!("RESULT_SIGNING_KEY not set; using insecure dev default");
                defaults.result_signing_key.clone()
            }
        };

        let journal_chunk_size: usize = parse(&get, "JOURNAL_CHUNK_SIZE", defaults.journal_chunk_size)?;

        Ok(Self {
            max_concurrent: parse(&get, "JOB_MAX_CONCURRENT", defaults.max_concurrent)?.max(1),
            job_timeout: millis(&get, "JOB_TIMEOUT_MS", defaults.job_timeout)?,
            retry_attempts: parse(&get, "JOB_RETRY_ATTEMPTS", defaults.retry_attempts)?,
            retry_delay: millis(&get, "JOB_RETRY_DELAY_MS", defaults.retry_delay)?,
            result_expiration: millis(&get, "JOB_RESULT_EXPIRATION_MS", defaults.result_expiration)?,
            cleanup_interval: millis(&get, "JOB_CLEANUP_INTERVAL_MS", defaults.cleanup_interval)?,
            poll_interval: millis(&get, "JOB_POLL_INTERVAL_MS", defaults.poll_interval)?,
            shutdown_timeout: millis(&get, "JOB_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout)?,
            max_result_bytes: parse(&get, "JOB_MAX_RESULT_BYTES", defaults.max_result_bytes)?,
            temp_dir: get("JOB_TEMP_DIR").map(PathBuf::from).unwrap_or(defaults.temp_dir),
            local_file_retry_delay: millis(
                &get,
                "JOB_LOCAL_FILE_RETRY_DELAY_MS",
                defaults.local_file_retry_delay,
            )?,
            journal_chunk_size: journal_chunk_size
                .clamp(MIN_JOURNAL_CHUNK_SIZE, MAX_JOURNAL_CHUNK_SIZE),
            result_store_dir: get("RESULT_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.result_store_dir),
            result_base_url: get("RESULT_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.result_base_url),
            result_signing_key,
            database_url: get("DATABASE_URL"),
        })
    }

    /// `DATABASE_URL`, required by the worker binary.
    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    /// Result retention window as a chrono duration (for `expires_at`).
    pub fn result_retention(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.result_expiration).unwrap_or(chrono::Duration::hours(24))
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

fn millis<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let ms: u64 = parse(get, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<JobQueueConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        JobQueueConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config, JobQueueConfig::default());
        assert_eq!(config.job_timeout, Duration::from_secs(30 * 60));
        assert_eq!(config.max_result_bytes, 52_428_800);
        assert!(config.database_url().is_err());
    }

    #[test]
    fn values_are_read_and_chunk_size_is_clamped() {
        let config = config_from(&[
            ("JOB_TIMEOUT_MS", "1500"),
            ("JOB_MAX_CONCURRENT", "2"),
            ("JOURNAL_CHUNK_SIZE", "5000"),
            ("RESULT_BASE_URL", "https://files.example.com/"),
            ("DATABASE_URL", "postgres://localhost/backoffice"),
        ])
        .unwrap();

        assert_eq!(config.job_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.journal_chunk_size, MAX_JOURNAL_CHUNK_SIZE);
        assert_eq!(config.result_base_url, "https://files.example.com");
        assert_eq!(config.database_url().unwrap(), "postgres://localhost/backoffice");

        let small = config_from(&[("JOURNAL_CHUNK_SIZE", "10")]).unwrap();
        assert_eq!(small.journal_chunk_size, MIN_JOURNAL_CHUNK_SIZE);
    }

    #[test]
    fn unparsable_value_is_an_error() {
        let err = config_from(&[("JOB_TIMEOUT_MS", "thirty minutes")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "JOB_TIMEOUT_MS",
                value: "thirty minutes".to_string()
            }
        );
    }
}
