//! Configuration types for mass-blocker

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Remote API access configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL every request is sent to (default: "https://api.twitter.com")
    ///
    /// Relative endpoints are joined onto it; absolute endpoint URLs have their
    /// scheme, host and port replaced by it, which lets a proxy front the API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// OAuth client id used for the refresh-token exchange
    #[serde(default)]
    pub client_id: String,

    /// Timeout for a single HTTP call (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// User-Agent header sent with every call
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            client_id: String::new(),
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Wake-up scheduling configuration
///
/// Every delay here is measured from the moment the decision is taken.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// How often the dispatcher polls for due timers (default: 1 second)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// Safety-net delay installed when a handler left state without a timer (default: 60 seconds)
    #[serde(default = "default_fallback_delay", with = "duration_serde")]
    pub fallback_delay: Duration,

    /// Delay for missing timers scheduled on a fresh install (default: 1 second)
    #[serde(default = "default_install_delay", with = "duration_serde")]
    pub install_delay: Duration,

    /// Delay of the first missing timer scheduled on restart (default: 300 seconds)
    #[serde(default = "default_startup_stagger_initial", with = "duration_serde")]
    pub startup_stagger_initial: Duration,

    /// Spacing between missing timers scheduled on restart (default: 60 seconds)
    #[serde(default = "default_startup_stagger_step", with = "duration_serde")]
    pub startup_stagger_step: Duration,

    /// First wake of a newly created operation (default: 1 second)
    #[serde(default = "default_new_operation_delay", with = "duration_serde")]
    pub new_operation_delay: Duration,

    /// First wake of a built-in operation created at bootstrap (default: 5 seconds)
    #[serde(default = "default_bootstrap_delay", with = "duration_serde")]
    pub bootstrap_delay: Duration,

    /// Re-check interval of a drained action queue (default: 300 seconds)
    #[serde(default = "default_queue_idle_interval", with = "duration_serde")]
    pub queue_idle_interval: Duration,

    /// Retry delay of an action queue after a transient error (default: 300 seconds)
    #[serde(default = "default_queue_error_delay", with = "duration_serde")]
    pub queue_error_delay: Duration,

    /// Minimum time between two full block/mute list syncs (default: 8 hours)
    #[serde(default = "default_collect_interval", with = "duration_serde")]
    pub collect_interval: Duration,

    /// Retry delay of a list sync after a transient error (default: 300 seconds)
    #[serde(default = "default_list_error_delay", with = "duration_serde")]
    pub list_error_delay: Duration,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            fallback_delay: default_fallback_delay(),
            install_delay: default_install_delay(),
            startup_stagger_initial: default_startup_stagger_initial(),
            startup_stagger_step: default_startup_stagger_step(),
            new_operation_delay: default_new_operation_delay(),
            bootstrap_delay: default_bootstrap_delay(),
            queue_idle_interval: default_queue_idle_interval(),
            queue_error_delay: default_queue_error_delay(),
            collect_interval: default_collect_interval(),
            list_error_delay: default_list_error_delay(),
        }
    }
}

/// Rate-limit handling configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Added to the server-reported reset time before resuming (default: 1 second)
    #[serde(default = "default_safety_margin", with = "duration_serde")]
    pub safety_margin: Duration,

    /// Wait used when a 429 carries no reset header (default: 15 minutes)
    #[serde(default = "default_missing_reset_wait", with = "duration_serde")]
    pub missing_reset_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            safety_margin: default_safety_margin(),
            missing_reset_wait: default_missing_reset_wait(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./mass-blocker.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Main configuration for the engine
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote API access
    #[serde(default)]
    pub api: ApiConfig,

    /// Wake-up scheduling
    #[serde(default)]
    pub scheduling: SchedulingConfig,

    /// Rate-limit handling
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Check settings that have no usable default
    pub fn validate(&self) -> Result<()> {
        if self.api.client_id.trim().is_empty() {
            return Err(Error::Config {
                message: "client id must not be empty".into(),
                key: Some("api.client_id".into()),
            });
        }
        url::Url::parse(&self.api.base_url).map_err(|e| Error::Config {
            message: format!("invalid base URL {:?}: {}", self.api.base_url, e),
            key: Some("api.base_url".into()),
        })?;
        if self.scheduling.poll_interval.is_zero() {
            return Err(Error::Config {
                message: "poll interval must be positive".into(),
                key: Some("scheduling.poll_interval".into()),
            });
        }
        if self.rate_limit.safety_margin.is_zero() {
            return Err(Error::Config {
                message: "rate-limit safety margin must be positive".into(),
                key: Some("rate_limit.safety_margin".into()),
            });
        }
        Ok(())
    }
}

fn default_base_url() -> String {
    "https://api.twitter.com".into()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    concat!("mass-blocker/", env!("CARGO_PKG_VERSION")).into()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_fallback_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_install_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_startup_stagger_initial() -> Duration {
    Duration::from_secs(300)
}

fn default_startup_stagger_step() -> Duration {
    Duration::from_secs(60)
}

fn default_new_operation_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_bootstrap_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_idle_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_queue_error_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_collect_interval() -> Duration {
    Duration::from_secs(8 * 3600)
}

fn default_list_error_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_safety_margin() -> Duration {
    Duration::from_secs(1)
}

fn default_missing_reset_wait() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./mass-blocker.db")
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
