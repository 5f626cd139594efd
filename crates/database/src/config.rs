use crate::error::{InstanceError, Result};
use reqwest::Url;
use std::time::Duration;

/// Process-wide settings every instance is configured with
#[derive(Debug, Clone)]
pub struct BaseConfig {
    /// Base URL of the tenant database API
    pub api_base_path: String,
    /// Verbose diagnostics only; no behavioral effect
    pub debug: bool,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            api_base_path: "http://localhost:8080/v2".to_string(),
            debug: false,
        }
    }
}

impl BaseConfig {
    pub fn new(api_base_path: impl Into<String>) -> Self {
        Self {
            api_base_path: api_base_path.into(),
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn from_env() -> Self {
        Self {
            api_base_path: std::env::var("TENANCY_API_BASE_PATH")
                .unwrap_or_else(|_| Self::default().api_base_path),
            debug: std::env::var("TENANCY_DEBUG")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_base_path.trim().is_empty() {
            return Err(InstanceError::Configuration(
                "api_base_path must not be empty".to_string(),
            ));
        }

        let url = Url::parse(&self.api_base_path).map_err(|e| {
            InstanceError::Configuration(format!(
                "Invalid api_base_path '{}': {}",
                self.api_base_path, e
            ))
        })?;

        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(InstanceError::Configuration(format!(
                "api_base_path must use http or https, got '{}'",
                other
            ))),
        }
    }
}

/// Upper bound for `idle_ttl` and `max_lifetime` (100 years)
pub const MAX_CACHE_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Limits for the instance cache
#[derive(Debug, Clone)]
pub struct InstanceCacheConfig {
    /// Maximum number of live instances; least recently used go first
    pub max_instances: u64,
    /// Instances idle longer than this are evicted
    pub idle_ttl: Duration,
    /// Hard cap on instance age, regardless of use
    pub max_lifetime: Option<Duration>,
}

impl Default for InstanceCacheConfig {
    fn default() -> Self {
        Self {
            max_instances: 1000,
            idle_ttl: Duration::from_secs(1800), // 30 minutes
            max_lifetime: None,
        }
    }
}

impl InstanceCacheConfig {
    pub fn from_env() -> Self {
        Self {
            max_instances: std::env::var("TENANCY_MAX_INSTANCES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            idle_ttl: Duration::from_secs(
                std::env::var("TENANCY_IDLE_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1800),
            ),
            max_lifetime: std::env::var("TENANCY_MAX_LIFETIME_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_instances == 0 {
            return Err(InstanceError::Configuration(
                "max_instances must be at least 1".to_string(),
            ));
        }
        if self.idle_ttl.is_zero() {
            return Err(InstanceError::Configuration(
                "idle_ttl must be greater than zero".to_string(),
            ));
        }
        if self.idle_ttl > MAX_CACHE_DURATION {
            return Err(InstanceError::Configuration(format!(
                "idle_ttl must not exceed {} seconds, got {}",
                MAX_CACHE_DURATION.as_secs(),
                self.idle_ttl.as_secs()
            )));
        }
        if let Some(max_lifetime) = self.max_lifetime {
            if max_lifetime.is_zero() || max_lifetime > MAX_CACHE_DURATION {
                return Err(InstanceError::Configuration(format!(
                    "max_lifetime must be between 1 and {} seconds, got {:?}",
                    MAX_CACHE_DURATION.as_secs(),
                    max_lifetime
                )));
            }
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
