//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Environment variable names.
pub mod env_keys {
    pub const API_URL: &str = "RESEARCH_DISCOVERY_API_URL";
    pub const API_TOKEN: &str = "RESEARCH_DISCOVERY_API_TOKEN";
    pub const REQUEST_TIMEOUT_SECS: &str = "RESEARCH_DISCOVERY_REQUEST_TIMEOUT_SECS";
    pub const SEARCH_TIMEOUT_SECS: &str = "RESEARCH_DISCOVERY_SEARCH_TIMEOUT_SECS";
    pub const POLL_INITIAL_DELAY_MS: &str = "RESEARCH_DISCOVERY_POLL_INITIAL_DELAY_MS";
    pub const POLL_INTERVAL_MS: &str = "RESEARCH_DISCOVERY_POLL_INTERVAL_MS";
    pub const POLL_BACKOFF: &str = "RESEARCH_DISCOVERY_POLL_BACKOFF";
    pub const POLL_MAX_INTERVAL_MS: &str = "RESEARCH_DISCOVERY_POLL_MAX_INTERVAL_MS";
    pub const POLL_TIMEOUT_SECS: &str = "RESEARCH_DISCOVERY_POLL_TIMEOUT_SECS";
    pub const POLL_RETRIES: &str = "RESEARCH_DISCOVERY_POLL_RETRIES";
    pub const HISTORY_LIMIT: &str = "RESEARCH_DISCOVERY_HISTORY_LIMIT";
}

/// Schedule for watching a long-running job.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Delay before the first status query.
    pub initial_delay: Duration,
    /// Interval after the first non-terminal response.
    pub poll_interval: Duration,
    /// Factor applied to the interval after each non-terminal response.
    pub backoff_multiplier: f64,
    /// Upper bound for the interval.
    pub max_interval: Duration,
    /// Give up watching after this long without a terminal status.
    pub timeout: Duration,
    /// Consecutive transport failures tolerated before the poll fails.
    pub max_transient_errors: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(3),
            backoff_multiplier: 1.5,
            max_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(900), // 15 minutes
            max_transient_errors: 3,
        }
    }
}

impl PollConfig {
    /// Check the schedule is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(invalid(env_keys::POLL_INTERVAL_MS, "must be greater than zero"));
        }
        if !(self.backoff_multiplier >= 1.0) || !self.backoff_multiplier.is_finite() {
            return Err(invalid(env_keys::POLL_BACKOFF, "must be a finite number >= 1.0"));
        }
        if self.max_interval < self.poll_interval {
            return Err(invalid(
                env_keys::POLL_MAX_INTERVAL_MS,
                "must not be smaller than the poll interval",
            ));
        }
        if self.timeout.is_zero() {
            return Err(invalid(env_keys::POLL_TIMEOUT_SECS, "must be greater than zero"));
        }
        Ok(())
    }

    /// Interval that follows `current` after a non-terminal response.
    pub fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_multiplier).min(self.max_interval)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Base URL of the analysis API.
    pub api_base_url: String,
    /// Optional bearer token sent with every request.
    pub api_token: Option<SecretString>,
    /// Per-request timeout enforced by the transport.
    pub request_timeout: Duration,
    /// Timeout for the deep research search request, which the server
    /// answers only once the search is done.
    pub search_timeout: Duration,
    /// Deep research polling schedule.
    pub poll: PollConfig,
    /// Number of prior session snapshots kept for inspection.
    pub history_limit: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5001".to_string(),
            api_token: None,
            request_timeout: Duration::from_secs(120), // quick read runs 1-2 minutes
            search_timeout: Duration::from_secs(900),
            poll: PollConfig::default(),
            history_limit: 32,
        }
    }
}

impl DiscoveryConfig {
    /// Load from process environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys keep their defaults;
    /// set keys that fail to parse are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(env_keys::API_URL) {
            let url = url.trim().trim_end_matches('/').to_string();
            if url.is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: env_keys::API_URL.to_string(),
                    hint: "Set it to the analysis API base URL, e.g. http://localhost:5001"
                        .to_string(),
                });
            }
            config.api_base_url = url;
        }

        config.api_token = lookup(env_keys::API_TOKEN)
            .filter(|t| !t.trim().is_empty())
            .map(SecretString::from);

        if let Some(secs) = parse_opt::<u64>(&lookup, env_keys::REQUEST_TIMEOUT_SECS)? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_opt::<u64>(&lookup, env_keys::SEARCH_TIMEOUT_SECS)? {
            config.search_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_opt::<u64>(&lookup, env_keys::POLL_INITIAL_DELAY_MS)? {
            config.poll.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_opt::<u64>(&lookup, env_keys::POLL_INTERVAL_MS)? {
            config.poll.poll_interval = Duration::from_millis(ms);
        }
        if let Some(factor) = parse_opt::<f64>(&lookup, env_keys::POLL_BACKOFF)? {
            config.poll.backoff_multiplier = factor;
        }
        if let Some(ms) = parse_opt::<u64>(&lookup, env_keys::POLL_MAX_INTERVAL_MS)? {
            config.poll.max_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_opt::<u64>(&lookup, env_keys::POLL_TIMEOUT_SECS)? {
            config.poll.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = parse_opt::<u32>(&lookup, env_keys::POLL_RETRIES)? {
            config.poll.max_transient_errors = retries;
        }
        if let Some(limit) = parse_opt::<usize>(&lookup, env_keys::HISTORY_LIMIT)? {
            config.history_limit = limit;
        }

        config.poll.validate()?;
        Ok(config)
    }
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &format!("{raw:?}: {e}"))),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
