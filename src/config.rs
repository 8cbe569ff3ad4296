use crate::blocking::{BlockAction, BlocklistConfig};
use crate::error::ConfigError;
use crate::rate_limiter::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Immutable configuration snapshot for the filtering core.
///
/// Hosts typically deserialize this from their own config file; every field
/// can also be overridden from the environment via `from_env`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub blocklist: BlocklistConfig,
    pub rate_limit: RateLimitConfig,
}

impl FilterConfig {
    /// Build a config from defaults plus `VORDR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(sources) = std::env::var("VORDR_BLOCKLIST_SOURCES") {
            config.blocklist.sources = sources
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(auto_update) = std::env::var("VORDR_BLOCKLIST_AUTO_UPDATE") {
            config.blocklist.auto_update = parse_bool(&auto_update, true);
        }

        if let Ok(interval) = std::env::var("VORDR_BLOCKLIST_UPDATE_INTERVAL") {
            config.blocklist.update_interval = parse_duration_secs(&interval)?;
        }

        if let Ok(timeout) = std::env::var("VORDR_BLOCKLIST_DOWNLOAD_TIMEOUT") {
            let timeout = parse_duration_secs(&timeout)?;
            if timeout.is_zero() {
                return Err(ConfigError::InvalidTimeout(
                    "download timeout must be greater than 0".to_string(),
                ));
            }
            config.blocklist.download_timeout = timeout;
        }

        if let Ok(enabled) = std::env::var("VORDR_RATE_LIMIT_ENABLED") {
            config.rate_limit.enabled = parse_bool(&enabled, false);
        }

        if let Ok(qps) = std::env::var("VORDR_RATE_LIMIT_QPS") {
            let parsed = qps
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidRateLimit(qps.clone()))?;
            if parsed <= 0.0 {
                return Err(ConfigError::InvalidRateLimit(
                    "requests per second must be greater than 0".to_string(),
                ));
            }
            config.rate_limit.requests_per_second = parsed;
        }

        if let Ok(burst) = std::env::var("VORDR_RATE_LIMIT_BURST") {
            let parsed = burst
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidRateLimit(burst.clone()))?;
            if parsed == 0 {
                return Err(ConfigError::InvalidRateLimit(
                    "burst must be greater than 0".to_string(),
                ));
            }
            config.rate_limit.burst = parsed;
        }

        if let Ok(action) = std::env::var("VORDR_RATE_LIMIT_ACTION") {
            config.rate_limit.action = BlockAction::parse_str(&action);
        }

        if let Ok(interval) = std::env::var("VORDR_RATE_LIMIT_CLEANUP_INTERVAL") {
            config.rate_limit.cleanup_interval = parse_duration_secs(&interval)?;
        }

        if let Ok(max_clients) = std::env::var("VORDR_RATE_LIMIT_MAX_CLIENTS") {
            config.rate_limit.max_tracked_clients = max_clients
                .parse::<usize>()
                .map_err(|_| ConfigError::ParseError(format!("invalid max clients: {}", max_clients)))?;
        }

        if let Ok(log_violations) = std::env::var("VORDR_RATE_LIMIT_LOG_VIOLATIONS") {
            config.rate_limit.log_violations = parse_bool(&log_violations, true);
        }

        Ok(config)
    }
}

fn parse_bool(s: &str, default: bool) -> bool {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default,
    }
}

fn parse_duration_secs(s: &str) -> Result<Duration, ConfigError> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::ParseError(format!("invalid duration: {}", s)))
}
