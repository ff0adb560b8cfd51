//! Fulfiller and pool configuration structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default extra obtainment attempts kept in flight above demand.
pub const DEFAULT_OBTAINMENT_SLACK: usize = 3;

/// Default pause after a provider failure or control-loop fault.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "CORE_POOL_";

/// Configuration for a fulfiller backed by a single dedicated provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleSourceConfig {
    /// Serve requests that require or prefer a local core. When `false` the
    /// fulfiller serves the remotable queue instead.
    pub fulfills_local_requests: bool,
    /// Let a local fulfiller take `PreferRemote` requests only once they have
    /// waited this long, giving remote fulfillers the first chance. `None`
    /// lets the local fulfiller take them straight away.
    pub remote_delay_ms: Option<u64>,
    /// Pause after a provider failure.
    pub retry_delay_ms: u64,
}

impl Default for SingleSourceConfig {
    fn default() -> Self {
        Self {
            fulfills_local_requests: true,
            remote_delay_ms: None,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl SingleSourceConfig {
    /// Local fulfiller defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose between the local and remotable request queues.
    #[must_use]
    pub const fn with_fulfills_local_requests(mut self, fulfills_local_requests: bool) -> Self {
        self.fulfills_local_requests = fulfills_local_requests;
        self
    }

    /// Set the age after which `PreferRemote` requests may run locally.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_remote_delay(mut self, delay: Duration) -> Self {
        self.remote_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    /// Set the pause after a provider failure.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Remote delay as a [`Duration`].
    #[must_use]
    pub fn remote_delay(&self) -> Option<Duration> {
        self.remote_delay_ms.map(Duration::from_millis)
    }

    /// Retry delay as a [`Duration`].
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.retry_delay_ms == 0 {
            return Err("retry_delay_ms must be greater than 0".into());
        }
        if self.remote_delay_ms.is_some() && !self.fulfills_local_requests {
            return Err("remote_delay_ms only applies to local fulfillers".into());
        }
        Ok(())
    }
}

/// Configuration for a fulfiller drawing from a provider collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipleSourceConfig {
    /// Also serve requests that require a local core.
    pub fulfills_local_requests: bool,
    /// Extra obtainment attempts kept in flight while demand is non-zero.
    pub obtainment_slack: usize,
    /// Backoff after a provider call fails, during which the provider stays
    /// engaged. Also the pause after a control-loop fault.
    pub retry_delay_ms: u64,
}

impl Default for MultipleSourceConfig {
    fn default() -> Self {
        Self {
            fulfills_local_requests: false,
            obtainment_slack: DEFAULT_OBTAINMENT_SLACK,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl MultipleSourceConfig {
    /// Remote fulfiller defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also serve `RequireLocal` requests.
    #[must_use]
    pub const fn with_fulfills_local_requests(mut self, fulfills_local_requests: bool) -> Self {
        self.fulfills_local_requests = fulfills_local_requests;
        self
    }

    /// Set the number of extra attempts kept in flight.
    #[must_use]
    pub const fn with_obtainment_slack(mut self, slack: usize) -> Self {
        self.obtainment_slack = slack;
        self
    }

    /// Set the provider failure backoff and control-loop fault pause.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Retry delay as a [`Duration`].
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.retry_delay_ms == 0 {
            return Err("retry_delay_ms must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root configuration for a [`WorkerPool`](crate::builders::WorkerPool).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Local fulfiller settings, used when a local provider is supplied.
    pub local: SingleSourceConfig,
    /// Remote fulfiller settings, used when remote providers are enabled.
    pub remote: MultipleSourceConfig,
    /// Run a multi-source fulfiller over the remote provider collection.
    pub enable_remote: bool,
}

impl WorkerPoolConfig {
    /// Defaults: local fulfiller only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the local fulfiller settings.
    #[must_use]
    pub fn with_local(mut self, local: SingleSourceConfig) -> Self {
        self.local = local;
        self
    }

    /// Replace the remote fulfiller settings.
    #[must_use]
    pub fn with_remote(mut self, remote: MultipleSourceConfig) -> Self {
        self.remote = remote;
        self
    }

    /// Enable or disable remote fulfilment.
    #[must_use]
    pub const fn with_remote_enabled(mut self, enabled: bool) -> Self {
        self.enable_remote = enabled;
        self
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<(), String> {
        if !self.local.fulfills_local_requests {
            return Err("local fulfiller must serve local requests".into());
        }
        self.local
            .validate()
            .map_err(|e| format!("local fulfiller invalid: {e}"))?;
        self.remote
            .validate()
            .map_err(|e| format!("remote fulfiller invalid: {e}"))?;
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from defaults overridden by `CORE_POOL_*`
    /// environment variables, loading a `.env` file first if present.
    ///
    /// Recognised: `CORE_POOL_ENABLE_REMOTE`, `CORE_POOL_REMOTE_DELAY_MS`,
    /// `CORE_POOL_LOCAL_RETRY_DELAY_MS`, `CORE_POOL_REMOTE_RETRY_DELAY_MS`,
    /// `CORE_POOL_OBTAINMENT_SLACK`, `CORE_POOL_REMOTE_FULFILLS_LOCAL`.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(value) = read_var(&lookup, "ENABLE_REMOTE")? {
            cfg.enable_remote = value;
        }
        if let Some(value) = read_var(&lookup, "REMOTE_DELAY_MS")? {
            cfg.local.remote_delay_ms = Some(value);
        }
        if let Some(value) = read_var(&lookup, "LOCAL_RETRY_DELAY_MS")? {
            cfg.local.retry_delay_ms = value;
        }
        if let Some(value) = read_var(&lookup, "REMOTE_RETRY_DELAY_MS")? {
            cfg.remote.retry_delay_ms = value;
        }
        if let Some(value) = read_var(&lookup, "OBTAINMENT_SLACK")? {
            cfg.remote.obtainment_slack = value;
        }
        if let Some(value) = read_var(&lookup, "REMOTE_FULFILLS_LOCAL")? {
            cfg.remote.fulfills_local_requests = value;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn read_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>, String>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{name}");
    lookup(&key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| format!("{key}: {e}"))
        })
        .transpose()
}
