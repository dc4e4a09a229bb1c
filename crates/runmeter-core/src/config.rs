// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Runmeter configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL for the run store
    pub database_url: String,
    /// Redis URL for the ledger and the job queue
    pub redis_url: String,
    /// Key namespace for ledger and queue keys
    pub redis_prefix: String,
    /// Redis list used as the job queue
    pub queue_name: String,
    /// Root directory of the local result store
    pub data_dir: PathBuf,
    /// Bucket name recorded on run rows
    pub result_bucket: String,
    /// Number of worker loop tasks
    pub worker_concurrency: usize,
    /// Worker lease length
    pub lease_duration: Duration,
    /// Reaper cycle
    pub reaper_interval: Duration,
    /// Reaper scan bound
    pub reaper_batch_size: i64,
    /// Reconcile cycle
    pub reconcile_interval: Duration,
    /// Minimum age of a stuck claim before reconcile touches it
    pub reconcile_threshold: Duration,
    /// Reconcile scan bound
    pub reconcile_batch_size: i64,
    /// Settlement receipt retention
    pub receipt_ttl: Duration,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_positive<T>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let value: T = var_or(key, default)
        .parse()
        .map_err(|_| ConfigError::Invalid(key, "must be a positive integer"))?;
    if value <= T::default() {
        return Err(ConfigError::Invalid(key, "must be a positive integer"));
    }
    Ok(value)
}

fn parse_secs(key: &'static str, default: &str) -> Result<Duration, ConfigError> {
    parse_positive::<u64>(key, default).map(Duration::from_secs)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `RUNMETER_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `RUNMETER_REDIS_URL` (default: `redis://127.0.0.1:6379`)
    /// - `RUNMETER_REDIS_PREFIX` (default: `runmeter`)
    /// - `RUNMETER_QUEUE_NAME` (default: `runmeter:jobs`)
    /// - `RUNMETER_DATA_DIR` (default: `.data`)
    /// - `RUNMETER_RESULT_BUCKET` (default: `results`)
    /// - `RUNMETER_WORKER_CONCURRENCY` (default: 2)
    /// - `RUNMETER_LEASE_SECS` (default: 300)
    /// - `RUNMETER_REAPER_INTERVAL_SECS` (default: 30)
    /// - `RUNMETER_REAPER_BATCH_SIZE` (default: 100)
    /// - `RUNMETER_RECONCILE_INTERVAL_SECS` (default: 120)
    /// - `RUNMETER_RECONCILE_THRESHOLD_SECS` (default: 300)
    /// - `RUNMETER_RECONCILE_BATCH_SIZE` (default: 50)
    /// - `RUNMETER_RECEIPT_TTL_SECS` (default: 2592000, 30 days)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("RUNMETER_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("RUNMETER_DATABASE_URL"))?;

        Ok(Self {
            database_url,
            redis_url: var_or("RUNMETER_REDIS_URL", "redis://127.0.0.1:6379"),
            redis_prefix: var_or("RUNMETER_REDIS_PREFIX", "runmeter"),
            queue_name: var_or("RUNMETER_QUEUE_NAME", "runmeter:jobs"),
            data_dir: PathBuf::from(var_or("RUNMETER_DATA_DIR", ".data")),
            result_bucket: var_or("RUNMETER_RESULT_BUCKET", "results"),
            worker_concurrency: parse_positive("RUNMETER_WORKER_CONCURRENCY", "2")?,
            lease_duration: parse_secs("RUNMETER_LEASE_SECS", "300")?,
            reaper_interval: parse_secs("RUNMETER_REAPER_INTERVAL_SECS", "30")?,
            reaper_batch_size: parse_positive("RUNMETER_REAPER_BATCH_SIZE", "100")?,
            reconcile_interval: parse_secs("RUNMETER_RECONCILE_INTERVAL_SECS", "120")?,
            reconcile_threshold: parse_secs("RUNMETER_RECONCILE_THRESHOLD_SECS", "300")?,
            reconcile_batch_size: parse_positive("RUNMETER_RECONCILE_BATCH_SIZE", "50")?,
            receipt_ttl: parse_secs("RUNMETER_RECEIPT_TTL_SECS", "2592000")?,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
