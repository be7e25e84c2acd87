/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PAGE_SIZE: u32 = 20;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the local cache (a temporary store is used when unset)
    pub data_dir: Option<PathBuf>,

    /// Messages requested per page
    pub page_size: u32,

    /// Minimum interval between two bulk notification fetches
    pub digest_fetch_cooldown: Duration,

    /// Background digest refresh period (None disables the poller)
    pub digest_poll_interval: Option<Duration>,

    /// A push token registered within this window is reused
    pub push_token_cooldown: Duration,

    /// How long a temp id -> server id mapping survives after its send completes
    pub reconciliation_retention: Duration,

    /// Buffer size of the engine event broadcast channel
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            page_size: DEFAULT_PAGE_SIZE,
            digest_fetch_cooldown: Duration::from_secs(30),
            digest_poll_interval: Some(Duration::from_secs(60)),
            push_token_cooldown: Duration::from_secs(5 * 60),
            reconciliation_retention: Duration::from_secs(60),
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    ///
    /// `args[0]` is the program name; every following argument must be a known flag.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Config::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = flag_value(args, i)?;
                    config.data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--page-size" => {
                    config.page_size = parse_page_size(flag_value(args, i)?)?;
                    i += 2;
                }
                "--digest-cooldown-secs" => {
                    config.digest_fetch_cooldown = parse_secs("--digest-cooldown-secs", flag_value(args, i)?)?;
                    i += 2;
                }
                "--digest-poll-secs" => {
                    let period = parse_secs("--digest-poll-secs", flag_value(args, i)?)?;
                    config.digest_poll_interval = (!period.is_zero()).then_some(period);
                    i += 2;
                }
                "--token-cooldown-secs" => {
                    config.push_token_cooldown = parse_secs("--token-cooldown-secs", flag_value(args, i)?)?;
                    i += 2;
                }
                other => {
                    return Err(SyncError::Config(format!(
                        "Unknown argument: {}. Usage: {} [--data-dir <path>] [--page-size <n>] [--digest-cooldown-secs <n>] [--digest-poll-secs <n>] [--token-cooldown-secs <n>]",
                        other,
                        args.first().map(String::as_str).unwrap_or("chatsync")
                    )));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(dir) = std::env::var("CHATSYNC_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(size) = std::env::var("CHATSYNC_PAGE_SIZE") {
            config.page_size = parse_page_size(&size)?;
        }

        Ok(config)
    }
}

fn flag_value<'a>(args: &'a [String], i: usize) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| SyncError::Config(format!("{} requires a value", args[i])))
}

fn parse_page_size(raw: &str) -> Result<u32> {
    match raw.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(SyncError::Config("--page-size must be a positive number".to_string())),
    }
}

fn parse_secs(flag: &str, raw: &str) -> Result<Duration> {
    raw.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| SyncError::Config(format!("{} must be a whole number of seconds", flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_without_flags() {
        let config = Config::from_args(&args(&["chatsync"])).unwrap();
        assert_eq!(config.push_token_cooldown, Duration::from_secs(300));
        assert!(config.page_size > 0);
    }

    #[test]
    fn test_flags_parsed() {
        let config = Config::from_args(&args(&[
            "chatsync",
            "--data-dir",
            "/tmp/chatsync",
            "--digest-cooldown-secs",
            "5",
            "--token-cooldown-secs",
            "60",
            "--digest-poll-secs",
            "0",
        ]))
        .unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/chatsync")));
        assert_eq!(config.digest_fetch_cooldown, Duration::from_secs(5));
        assert_eq!(config.push_token_cooldown, Duration::from_secs(60));
        assert_eq!(config.digest_poll_interval, None);
    }

    #[test]
    fn test_bad_flags_rejected() {
        assert!(Config::from_args(&args(&["chatsync", "--page-size", "0"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "--data-dir"])).is_err());
        assert!(Config::from_args(&args(&["chatsync", "--bogus"])).is_err());
    }
}
