//! Configuration module for the sync host.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bootstrap::RetryPolicy;
use crate::errors::ConfigError;
use crate::models::DEFAULT_SESSION;
use crate::reaper::DEFAULT_RETENTION_DAYS;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite file backing the remote table store
    pub db_path: PathBuf,
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Days a soft-deleted record stays in the recycle bin
    pub retention_days: i64,
    pub bootstrap_retries: u32,
    pub bootstrap_delay: Duration,
    /// `None` disables the periodic reaper
    pub reaper_interval: Option<Duration>,
    /// Session used until a configuration record is loaded
    pub default_session: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let db_path = env::var("SCHOOLBOOK_DB_PATH")
            .unwrap_or_else(|_| "./data/remote.sqlite".to_string())
            .into();

        let bind_addr = parse_var("SCHOOLBOOK_BIND_ADDR", "127.0.0.1:8080")?;

        let log_level = env::var("SCHOOLBOOK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let retention_days: i64 = parse_var(
            "SCHOOLBOOK_RETENTION_DAYS",
            &DEFAULT_RETENTION_DAYS.to_string(),
        )?;
        if retention_days < 1 {
            return Err(ConfigError {
                name: "SCHOOLBOOK_RETENTION_DAYS",
                reason: "must be at least 1".to_string(),
            });
        }

        let bootstrap_retries = parse_var("SCHOOLBOOK_BOOTSTRAP_RETRIES", "2")?;
        let bootstrap_delay =
            Duration::from_millis(parse_var("SCHOOLBOOK_BOOTSTRAP_DELAY_MS", "2000")?);

        let reaper_secs: u64 = parse_var("SCHOOLBOOK_REAPER_INTERVAL_SECS", "21600")?;
        let reaper_interval = (reaper_secs > 0).then(|| Duration::from_secs(reaper_secs));

        let default_session = env::var("SCHOOLBOOK_DEFAULT_SESSION")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SESSION.to_string());

        Ok(Self {
            db_path,
            bind_addr,
            log_level,
            retention_days,
            bootstrap_retries,
            bootstrap_delay,
            reaper_interval,
            default_session,
        })
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.bootstrap_retries, self.bootstrap_delay)
    }
}

fn parse_var<T>(name: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse().map_err(|e: T::Err| ConfigError {
        name,
        reason: format!("'{}': {}", raw, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 8] = [
        "SCHOOLBOOK_DB_PATH",
        "SCHOOLBOOK_BIND_ADDR",
        "SCHOOLBOOK_LOG_LEVEL",
        "SCHOOLBOOK_RETENTION_DAYS",
        "SCHOOLBOOK_BOOTSTRAP_RETRIES",
        "SCHOOLBOOK_BOOTSTRAP_DELAY_MS",
        "SCHOOLBOOK_REAPER_INTERVAL_SECS",
        "SCHOOLBOOK_DEFAULT_SESSION",
    ];

    // Both cases share the process environment, so they run in one test.
    #[test]
    fn test_config_from_env() {
        for var in VARS {
            env::remove_var(var);
        }

        let config = Config::from_env().unwrap();

        assert_eq!(config.db_path, PathBuf::from("./data/remote.sqlite"));
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.retention(), chrono::Duration::days(30));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.reaper_interval, Some(Duration::from_secs(21600)));
        assert_eq!(config.default_session, "2024-2025");

        env::set_var("SCHOOLBOOK_REAPER_INTERVAL_SECS", "0");
        assert_eq!(Config::from_env().unwrap().reaper_interval, None);

        env::set_var("SCHOOLBOOK_BOOTSTRAP_RETRIES", "lots");
        let err = Config::from_env().unwrap_err();
        assert_eq!(err.name, "SCHOOLBOOK_BOOTSTRAP_RETRIES");

        for var in VARS {
            env::remove_var(var);
        }
    }
}
