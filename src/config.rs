//! Environment-driven configuration.

use std::env;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// Runtime configuration of the core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL.
    pub database_url: String,

    /// Expected concurrent command handlers, used to size the pool.
    pub expected_concurrent_commands: u32,

    /// Number of registered projections, used to size the pool.
    pub projection_count: u32,

    /// Default projection poll interval.
    pub projection_poll_interval: Duration,

    /// Default projection batch size.
    pub projection_batch_size: u32,
}

impl Config {
    /// Loads configuration from environment variables, reading a `.env`
    /// file first when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let expected_concurrent_commands = parse_env("IDHUB_CONCURRENT_COMMANDS", 8)?;
        let projection_count = parse_env("IDHUB_PROJECTION_COUNT", 16)?;
        let poll_interval_ms: u64 = parse_env("IDHUB_PROJECTION_POLL_INTERVAL_MS", 1_000)?;
        let projection_batch_size = parse_env("IDHUB_PROJECTION_BATCH_SIZE", 200)?;

        Ok(Self {
            database_url,
            expected_concurrent_commands,
            projection_count,
            projection_poll_interval: Duration::from_millis(poll_interval_ms),
            projection_batch_size,
        })
    }

    /// Pool size: `max(expected_concurrent_commands + 2·projections, 16)`.
    pub fn pool_size(&self) -> u32 {
        (self.expected_concurrent_commands + 2 * self.projection_count).max(16)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

/// Initializes tracing for the process. Safe to call multiple times.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Config;

    #[test]
    fn pool_size_follows_sizing_rule() {
        let config = Config {
            database_url: "postgres://localhost/idhub".to_owned(),
            expected_concurrent_commands: 4,
            projection_count: 2,
            projection_poll_interval: Duration::from_secs(1),
            projection_batch_size: 200,
        };
        // 4 + 2*2 = 8 < 16 floor
        assert_eq!(config.pool_size(), 16);

        let config = Config {
            expected_concurrent_commands: 10,
            projection_count: 8,
            ..config
        };
        assert_eq!(config.pool_size(), 26);
    }
}
