//! Environment-driven runtime configuration.
//!
//! Everything is read once at startup into a plain [`Config`] record and
//! passed by reference to the components that need it. A `.env` file is
//! honored when present (see the binaries).

use std::time::Duration;

/// Error raised while reading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is missing.
    #[error("{0} is not set")]
    Missing(&'static str),
    /// A variable is present but does not parse.
    #[error("invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}

/// Knobs for the recovery controller and per-job recovery defaults.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    /// Global kill-switch for interval-progress replay.
    pub enable_recovery: bool,
    /// Default `enable_recovery` flag for newly created jobs.
    pub default_recovery_enabled: bool,
    /// How often the sweep for incomplete intervals runs.
    pub check_interval: Duration,
    /// Attempt budget for `task_recovery` queue entries.
    pub max_attempts: i32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enable_recovery: true,
            default_recovery_enabled: true,
            check_interval: Duration::from_secs(300),
            max_attempts: 3,
        }
    }
}

/// Runtime configuration for both the API server and the worker.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: String,
    /// API listen port.
    pub port: u16,
    /// HS256 secret for bearer-JWT verification. Required by the API binary.
    pub jwt_secret: Option<String>,
    /// CORS allow-list.
    pub allowed_origins: Vec<String>,
    /// Queue worker slots.
    pub max_workers: usize,
    /// Upper bound of the shared connection pool.
    pub max_db_connections: u32,
    /// Lower bound of the shared connection pool.
    pub min_db_connections: u32,
    /// Recovery knobs.
    pub recovery: RecoveryConfig,
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            port: env_parse("PORT", 3008)?,
            jwt_secret: std::env::var("JWT_SECRET_KEY").ok().filter(|s| !s.is_empty()),
            allowed_origins: env_list("ALLOWED_ORIGINS", &["http://localhost:3000"]),
            max_workers: env_parse("MAX_WORKERS", 10)?,
            max_db_connections: env_parse("MAX_DB_CONNECTION", 100)?,
            min_db_connections: env_parse("MIN_DB_CONNECTION", 20)?,
            recovery: RecoveryConfig {
                enable_recovery: env_bool("ENABLE_RECOVERY", true)?,
                default_recovery_enabled: env_bool("DEFAULT_RECOVERY_ENABLED", true)?,
                check_interval: Duration::from_secs(env_parse("RECOVERY_CHECK_INTERVAL", 300)?),
                max_attempts: env_parse("MAX_RECOVERY_ATTEMPTS", 3)?,
            },
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => {
            raw.parse().map_err(|_| ConfigError::Invalid(key, raw))
        }
        _ => Ok(default),
    }
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => {
            parse_bool(&raw).ok_or(ConfigError::Invalid(key, raw))
        }
        _ => Ok(default),
    }
}

fn env_list(key: &'static str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(|item| item.trim().to_owned())
            .filter(|item| !item.is_empty())
            .collect(),
        _ => default.iter().map(|item| (*item).to_owned()).collect(),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("no"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn recovery_defaults_match_documentation() {
        let recovery = RecoveryConfig::default();
        assert!(recovery.enable_recovery);
        assert!(recovery.default_recovery_enabled);
        assert_eq!(recovery.check_interval, Duration::from_secs(300));
        assert_eq!(recovery.max_attempts, 3);
    }
}
