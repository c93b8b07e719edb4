/// Configuration management
use crate::error::{MessagingError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 17082;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP API port (bound on 127.0.0.1)
    pub port: u16,

    /// Directory holding the messaging database
    pub data_dir: PathBuf,

    /// How long tombstoned messages stay visible before being purged
    pub tombstone_retention: Duration,

    /// Interval between purge runs
    pub purge_interval: Duration,

    /// Page size when a client gives no limit
    pub default_page_size: usize,

    /// Upper bound on any client-supplied limit
    pub max_page_size: usize,

    /// Slack subtracted from conversation-list cursors
    pub sync_overlap: Duration,

    /// Client cadence for conversation-list polls
    pub list_poll_interval: Duration,

    /// Client cadence for open-conversation polls
    pub message_poll_interval: Duration,

    /// Cap on backed-off poll delays
    pub max_poll_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: PathBuf::from(".huddle"),
            tombstone_retention: Duration::from_secs(30 * 86_400),
            purge_interval: Duration::from_secs(3600),
            default_page_size: 50,
            max_page_size: 200,
            sync_overlap: Duration::from_secs(2),
            list_poll_interval: Duration::from_secs(30),
            message_poll_interval: Duration::from_secs(10),
            max_poll_backoff: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Create config from command line arguments, then apply `HUDDLE_*` env overrides
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = || {
                args.get(i + 1)
                    .ok_or_else(|| MessagingError::Config(format!("{} requires a value", flag)))
            };
            match flag {
                "--port" => config.port = parse_num(flag, value()?)?,
                "--data-dir" => config.data_dir = PathBuf::from(value()?),
                "--tombstone-retention-days" => {
                    config.tombstone_retention = parse_days(flag, value()?)?;
                }
                "--purge-interval-secs" => {
                    config.purge_interval = Duration::from_secs(parse_num(flag, value()?)?)
                }
                "--default-page-size" => config.default_page_size = parse_num(flag, value()?)?,
                "--max-page-size" => config.max_page_size = parse_num(flag, value()?)?,
                other => {
                    return Err(MessagingError::Config(format!(
                        "Unknown argument '{}'. Usage: {} [--port <port>] [--data-dir <path>] \
                         [--tombstone-retention-days <n>] [--purge-interval-secs <n>] \
                         [--default-page-size <n>] [--max-page-size <n>]",
                        other,
                        args.first().map(String::as_str).unwrap_or("huddle-server")
                    )))
                }
            }
            i += 2;
        }

        // Env overrides (nice for containers)
        if let Ok(p) = std::env::var("HUDDLE_PORT") {
            config.port = parse_num("HUDDLE_PORT", &p)?;
        }
        if let Ok(dir) = std::env::var("HUDDLE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(days) = std::env::var("HUDDLE_TOMBSTONE_RETENTION_DAYS") {
            config.tombstone_retention = parse_days("HUDDLE_TOMBSTONE_RETENTION_DAYS", &days)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(MessagingError::Config("page sizes must be positive".to_string()));
        }
        if self.default_page_size > self.max_page_size {
            return Err(MessagingError::Config(
                "default page size exceeds max page size".to_string(),
            ));
        }
        if self.purge_interval.is_zero() {
            return Err(MessagingError::Config("purge interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Whole days as a `Duration`; rejects counts that overflow
fn parse_days(name: &str, raw: &str) -> Result<Duration> {
    let days: u64 = parse_num(name, raw)?;
    days.checked_mul(86_400)
        .map(Duration::from_secs)
        .ok_or_else(|| MessagingError::Config(format!("{} is too large: {}", name, days)))
}

fn parse_num<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| MessagingError::Config(format!("{} must be a valid number, got '{}'", name, raw)))
}
