use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::queue::{QueueConfig, RetryPolicy};

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    pub github_webhook_secret: String,
    /// API root for GitHub Enterprise Server; `None` means github.com.
    pub github_api_base: Option<String>,
    pub openai_api_key: String,
    pub openai_model: Option<String>,
    pub port: u16,
    /// Directory holding `reviewq.db` and `queue.db`.
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub worker_concurrency: usize,
    pub queue: QueueConfig,
    pub maintenance_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_app_id = env::var("GITHUB_APP_ID")
            .context("GITHUB_APP_ID environment variable is required")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = unescape_private_key(
            &env::var("GITHUB_PRIVATE_KEY")
                .context("GITHUB_PRIVATE_KEY environment variable is required")?,
        );

        let github_webhook_secret = env::var("GITHUB_WEBHOOK_SECRET")
            .context("GITHUB_WEBHOOK_SECRET environment variable is required")?;

        let github_api_base = parse_optional_string(env::var("GITHUB_API_BASE").ok());

        let openai_api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable is required")?;

        let openai_model = parse_optional_string(env::var("OPENAI_MODEL").ok());

        let port = parse_or_default::<u16>("PORT", env::var("PORT").ok(), 3000)?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let worker_concurrency =
            parse_worker_concurrency(env::var("WORKER_CONCURRENCY").ok())?;

        let lease_seconds =
            parse_or_default::<u64>("QUEUE_LEASE_SECONDS", env::var("QUEUE_LEASE_SECONDS").ok(), 600)?;
        let max_attempts =
            parse_or_default::<u32>("QUEUE_MAX_ATTEMPTS", env::var("QUEUE_MAX_ATTEMPTS").ok(), 3)?;
        let backoff_base_ms = parse_or_default::<u64>(
            "QUEUE_BACKOFF_BASE_MS",
            env::var("QUEUE_BACKOFF_BASE_MS").ok(),
            1000,
        )?;
        let queue = queue_config(lease_seconds, max_attempts, backoff_base_ms)?;

        let maintenance_seconds = parse_or_default::<u64>(
            "MAINTENANCE_INTERVAL_SECONDS",
            env::var("MAINTENANCE_INTERVAL_SECONDS").ok(),
            30,
        )?;
        if maintenance_seconds == 0 {
            return Err(anyhow!("MAINTENANCE_INTERVAL_SECONDS must be at least 1"));
        }

        Ok(Config {
            github_app_id,
            github_private_key,
            github_webhook_secret,
            github_api_base,
            openai_api_key,
            openai_model,
            port,
            state_dir,
            worker_concurrency,
            queue,
            maintenance_interval: Duration::from_secs(maintenance_seconds),
        })
    }

    pub fn record_db_path(&self) -> PathBuf {
        self.state_dir.join("reviewq.db")
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.state_dir.join("queue.db")
    }
}

/// Private keys pasted into a single env var carry literal `\n` sequences.
pub fn unescape_private_key(value: &str) -> String {
    value.replace("\\n", "\n")
}

/// Parse an optional numeric variable, falling back to `default` when unset
/// or blank.
pub fn parse_or_default<T>(name: &str, value: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number, got '{}'", name, raw)),
    }
}

/// Returns None if the value is missing, empty, or contains only whitespace.
pub fn parse_optional_string(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

pub fn parse_worker_concurrency(value: Option<String>) -> Result<usize> {
    let workers = parse_or_default::<usize>("WORKER_CONCURRENCY", value, 2)?;
    if workers == 0 {
        return Err(anyhow!("WORKER_CONCURRENCY must be at least 1"));
    }
    Ok(workers)
}

pub fn queue_config(lease_seconds: u64, max_attempts: u32, backoff_base_ms: u64) -> Result<QueueConfig> {
    if lease_seconds == 0 {
        return Err(anyhow!("QUEUE_LEASE_SECONDS must be at least 1"));
    }
    if max_attempts == 0 {
        return Err(anyhow!("QUEUE_MAX_ATTEMPTS must be at least 1"));
    }
    Ok(QueueConfig {
        lease_duration: Duration::from_secs(lease_seconds),
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(backoff_base_ms),
        },
        ..QueueConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_private_key() {
        assert_eq!(
            unescape_private_key("-----BEGIN-----\\nabc\\n-----END-----"),
            "-----BEGIN-----\nabc\n-----END-----"
        );
    }

    #[test]
    fn test_parse_or_default_unset_and_blank() {
        assert_eq!(parse_or_default::<u16>("PORT", None, 3000).unwrap(), 3000);
        assert_eq!(
            parse_or_default::<u16>("PORT", Some("  ".to_string()), 3000).unwrap(),
            3000
        );
    }

    #[test]
    fn test_parse_or_default_value() {
        assert_eq!(
            parse_or_default::<u16>("PORT", Some(" 8080 ".to_string()), 3000).unwrap(),
            8080
        );
    }

    #[test]
    fn test_parse_or_default_names_the_variable() {
        let err = parse_or_default::<u16>("PORT", Some("eighty".to_string()), 3000).unwrap_err();
        assert!(err.to_string().contains("PORT"));
        assert!(err.to_string().contains("eighty"));
    }

    #[test]
    fn test_parse_optional_string() {
        assert_eq!(parse_optional_string(None), None);
        assert_eq!(parse_optional_string(Some("   ".to_string())), None);
        assert_eq!(
            parse_optional_string(Some("gpt-4o".to_string())),
            Some("gpt-4o".to_string())
        );
    }

    #[test]
    fn test_worker_concurrency() {
        assert_eq!(parse_worker_concurrency(None).unwrap(), 2);
        assert_eq!(parse_worker_concurrency(Some("8".to_string())).unwrap(), 8);
        assert!(parse_worker_concurrency(Some("0".to_string())).is_err());
        assert!(parse_worker_concurrency(Some("-1".to_string())).is_err());
    }

    #[test]
    fn test_queue_config() {
        let config = queue_config(600, 3, 1000).unwrap();
        assert_eq!(config.lease_duration, Duration::from_secs(600));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.completed_retention, Duration::from_secs(3600));

        assert!(queue_config(0, 3, 1000).is_err());
        assert!(queue_config(600, 0, 1000).is_err());
    }
}
