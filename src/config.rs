use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;

use crate::{error::Error, policy::BackoffPolicy};

const DEFAULT_INTERVAL_MINUTES: u64 = 15;
const DEFAULT_BACKOFF_MINUTES: u64 = 15;
const DEFAULT_MAX_RETRIES: u32 = 10;
const DEFAULT_BATCH_SIZE: u32 = 50;
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 300;

/// Runtime configuration, read from `REDELIVER_*` environment variables.
///
/// Every field is optional; the accessors fall back to the defaults.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,

    /// Cadence of the scheduler tick.
    pub interval_minutes: Option<u64>,
    /// Base interval of the linear backoff.
    pub backoff_minutes: Option<u64>,
    /// Ceiling assigned to new messages that don't carry their own.
    pub max_retries: Option<u32>,
    /// Maximum number of messages considered per tick.
    pub batch_size: Option<u32>,
    pub attempt_timeout_secs: Option<u64>,
    /// How long an abandoned lease blocks a message before it can be re-acquired.
    pub lease_timeout_secs: Option<u64>,

    pub gateway_url: Option<url::Url>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        let config = envy::prefixed("REDELIVER_").from_env::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn in_memory() -> Self {
        Self {
            db_path: Some(":memory:".to_owned()),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.interval_minutes() == 0 {
            return Err(Error::invalid_parameter("interval_minutes must be positive"));
        }
        if self.max_retries() == 0 {
            return Err(Error::invalid_parameter("max_retries must be positive"));
        }
        if self.batch_size() == 0 {
            return Err(Error::invalid_parameter("batch_size must be positive"));
        }
        if self.attempt_timeout().is_zero() {
            return Err(Error::invalid_parameter("attempt_timeout_secs must be positive"));
        }
        if self.lease_timeout() <= self.attempt_timeout() {
            return Err(Error::invalid_parameter(
                "lease_timeout_secs must be greater than attempt_timeout_secs",
            ));
        }
        self.backoff_policy()?;
        self.lease_delta()?;
        Ok(())
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or("redeliver.db")
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8080)
    }

    pub fn interval_minutes(&self) -> u64 {
        self.interval_minutes.unwrap_or(DEFAULT_INTERVAL_MINUTES)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes().saturating_mul(60))
    }

    pub fn backoff_minutes(&self) -> u64 {
        self.backoff_minutes.unwrap_or(DEFAULT_BACKOFF_MINUTES)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(
            self.attempt_timeout_secs
                .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT_SECS),
        )
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs.unwrap_or(DEFAULT_LEASE_TIMEOUT_SECS))
    }

    pub fn gateway_url(&self) -> Option<&url::Url> {
        self.gateway_url.as_ref()
    }

    pub fn backoff_policy(&self) -> Result<BackoffPolicy, Error> {
        let base_interval = i64::try_from(self.backoff_minutes())
            .ok()
            .and_then(TimeDelta::try_minutes)
            .filter(|d| *d > TimeDelta::zero())
            .ok_or_else(|| Error::invalid_parameter("backoff_minutes is out of range"))?;

        Ok(BackoffPolicy::new(base_interval, self.max_retries()))
    }

    pub fn lease_delta(&self) -> Result<TimeDelta, Error> {
        TimeDelta::from_std(self.lease_timeout())
            .map_err(|_| Error::invalid_parameter("lease_timeout_secs is out of range"))
    }
}
