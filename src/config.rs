use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

use crate::usage::AggregatorSettings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Credentials for the n8n instance the built-in relay forwards to.
#[derive(Clone)]
pub struct N8nConfig {
    pub base_url: String,
    pub api_key: String,
}

impl std::fmt::Debug for N8nConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("N8nConfig")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub frontend_origin: String,
    pub bind_addr: SocketAddr,
    pub relay_url: String,
    pub relay_token: String,
    pub relay_timeout: Duration,
    pub admin_api_token: String,
    pub n8n: Option<N8nConfig>,
    pub credentials_encryption_key: Option<String>,
    pub webhook_signing_secret: Option<String>,
    pub usage_timezone: Tz,
    pub poll_interval: Duration,
    pub aggregator: AggregatorSettings,
    pub rate_limit_ms: u64,
    pub rate_limit_burst: u32,
    pub json_logs: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("frontend_origin", &self.frontend_origin)
            .field("bind_addr", &self.bind_addr)
            .field("relay_url", &self.relay_url)
            .field("n8n", &self.n8n)
            .field("usage_timezone", &self.usage_timezone)
            .field("poll_interval", &self.poll_interval)
            .field("aggregator", &self.aggregator)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok(); // Load .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let database_url = required("DATABASE_URL")?;
        let frontend_origin = required("FRONTEND_ORIGIN")?;
        let relay_url = required("RELAY_URL")?;
        let relay_token = required("RELAY_TOKEN")?;
        let admin_api_token = required("ADMIN_API_TOKEN")?;

        let bind_addr = parse_or("BIND_ADDR", get("BIND_ADDR"), SocketAddr::from(([127, 0, 0, 1], 3000)))?;

        let n8n = match (get("N8N_BASE_URL"), get("N8N_API_KEY")) {
            (Some(base_url), Some(api_key)) => Some(N8nConfig { base_url, api_key }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("N8N_API_KEY")),
            (None, Some(_)) => return Err(ConfigError::Missing("N8N_BASE_URL")),
        };

        let usage_timezone = match get("USAGE_TIMEZONE") {
            Some(name) => name.parse::<Tz>().map_err(|err| ConfigError::Invalid {
                key: "USAGE_TIMEZONE",
                reason: err.to_string(),
            })?,
            None => Tz::UTC,
        };

        let poll_seconds: u64 = parse_or(
            "USAGE_POLL_INTERVAL_SECONDS",
            get("USAGE_POLL_INTERVAL_SECONDS"),
            30,
        )?;
        let relay_timeout_seconds: u64 =
            parse_or("RELAY_TIMEOUT_SECONDS", get("RELAY_TIMEOUT_SECONDS"), 20)?;
        let defaults = AggregatorSettings::default();
        let aggregator = AggregatorSettings {
            execution_limit: parse_or(
                "USAGE_EXECUTION_LIMIT",
                get("USAGE_EXECUTION_LIMIT"),
                defaults.execution_limit,
            )?,
            detail_limit: parse_or(
                "USAGE_DETAIL_LIMIT",
                get("USAGE_DETAIL_LIMIT"),
                defaults.detail_limit,
            )?,
            batch_size: parse_or(
                "USAGE_DETAIL_BATCH_SIZE",
                get("USAGE_DETAIL_BATCH_SIZE"),
                defaults.batch_size,
            )?,
        };
        if poll_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "USAGE_POLL_INTERVAL_SECONDS",
                reason: "must be greater than zero".into(),
            });
        }
        if aggregator.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "USAGE_DETAIL_BATCH_SIZE",
                reason: "must be greater than zero".into(),
            });
        }

        Ok(Config {
            database_url,
            frontend_origin,
            bind_addr,
            relay_url,
            relay_token,
            relay_timeout: Duration::from_secs(relay_timeout_seconds),
            admin_api_token,
            n8n,
            credentials_encryption_key: get("CREDENTIALS_ENCRYPTION_KEY"),
            webhook_signing_secret: get("WEBHOOK_SIGNING_SECRET"),
            usage_timezone,
            poll_interval: Duration::from_secs(poll_seconds),
            aggregator,
            // Default: 200ms/token (~5 req/sec)
            rate_limit_ms: parse_or(
                "RATE_LIMITER_MILLISECONDS",
                get("RATE_LIMITER_MILLISECONDS"),
                200,
            )?,
            // Default: allow short bursts during dashboard polling
            rate_limit_burst: parse_or("RATE_LIMITER_BURST", get("RATE_LIMITER_BURST"), 20)?,
            json_logs: get("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
        })
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse::<T>().map_err(|err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}
