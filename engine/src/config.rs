//! Engine configuration.

use std::env;
use std::time::Duration;

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Root URL of the origin; `/api/...` is appended
    pub api_base_url: String,
    /// Replica database, `sqlite:` URL
    pub database_url: String,
    /// Time between scheduled pulls while a session is active
    pub reconcile_interval: Duration,
    /// Upper bound on every origin call
    pub request_timeout: Duration,
    /// Rejections tolerated before an outbox entry is parked
    pub max_attempts: u32,
    /// Locale used when a translation lacks the requested one
    pub default_locale: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            database_url: "sqlite://till-sync.db".to_string(),
            reconcile_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            max_attempts: 5,
            default_locale: "en".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_base_url = env::var("TILL_API_BASE_URL").unwrap_or(defaults.api_base_url);
        let database_url = env::var("TILL_DATABASE_URL").unwrap_or(defaults.database_url);
        let default_locale = env::var("TILL_DEFAULT_LOCALE").unwrap_or(defaults.default_locale);

        let reconcile_interval = match env::var("TILL_RECONCILE_INTERVAL_SECS") {
            Ok(raw) => Duration::from_secs(parse_positive("TILL_RECONCILE_INTERVAL_SECS", &raw)?),
            Err(_) => defaults.reconcile_interval,
        };
        let request_timeout = match env::var("TILL_REQUEST_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(parse_positive("TILL_REQUEST_TIMEOUT_SECS", &raw)?),
            Err(_) => defaults.request_timeout,
        };
        let max_attempts = match env::var("TILL_MAX_ATTEMPTS") {
            Ok(raw) => u32::try_from(parse_positive("TILL_MAX_ATTEMPTS", &raw)?).map_err(|_| {
                ConfigError::Invalid {
                    name: "TILL_MAX_ATTEMPTS",
                    value: raw,
                }
            })?,
            Err(_) => defaults.max_attempts,
        };

        Ok(Self {
            api_base_url,
            database_url,
            reconcile_interval,
            request_timeout,
            max_attempts,
            default_locale,
        })
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconcile_interval.is_zero() {
            return Err(ConfigError::Invalid {
                name: "reconcile_interval",
                value: format!("{:?}", self.reconcile_interval),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "request_timeout",
                value: format!("{:?}", self.request_timeout),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "max_attempts",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_default_locale(mut self, locale: impl Into<String>) -> Self {
        self.default_locale = locale.into();
        self
    }
}

fn parse_positive(name: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::Invalid {
            name,
            value: raw.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}
