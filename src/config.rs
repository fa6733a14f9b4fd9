//! Configuration for the sync engine and its binaries
//!
//! Configuration can be loaded from:
//! - Default values
//! - Config file (~/.config/jobtrack/config.toml)
//! - Environment variables (`JOBTRACK_API_URL`, `JOBTRACK_USER_ID`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::remote::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// RemoteAPI configuration
    pub api: ApiConfig,
    /// Per-request retry policy
    pub retry: RetryConfig,
    /// Background replay
    pub replay: ReplayConfig,
    /// Local durable cache
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Backend base URL (without the `/api` suffix)
    pub base_url: String,
    /// Value of the `x-user-id` header
    pub user_id: String,
    /// Client-level HTTP timeout in seconds
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per request, including the first
    pub max_attempts: u32,
    /// Delay unit; attempt n waits n times this long
    pub base_delay_ms: u64,
    /// Per-attempt timeout
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// How often the background task retries the pending queue
    pub interval_secs: u64,
    /// Replay as soon as connectivity returns
    pub replay_on_reconnect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the cache and queue files
    pub data_dir: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            user_id: "default".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            request_timeout_secs: 15,
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            replay_on_reconnect: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir: data_dir.join("jobtrack"),
        }
    }
}

impl Config {
    /// Get default configuration file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jobtrack")
            .join("config.toml")
    }

    /// Load configuration from file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&Path>) -> anyhow::Result<()> {
        let path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("JOBTRACK_API_URL") {
            if !url.is_empty() {
                self.api.base_url = url;
            }
        }
        if let Ok(user) = std::env::var("JOBTRACK_USER_ID") {
            if !user.is_empty() {
                self.api.user_id = user;
            }
        }
    }

    /// Retry policy for RemoteAPI calls
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            request_timeout: Duration::from_secs(self.retry.request_timeout_secs),
        }
    }

    /// Get background replay interval
    pub fn replay_interval(&self) -> Duration {
        Duration::from_secs(self.replay.interval_secs.max(1))
    }

    /// Get client-level HTTP timeout
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.replay.interval_secs, 300);
        assert_eq!(config.retry_policy().request_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [api]
            base_url = "https://tracker.example"

            [retry]
            base_delay_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.api.base_url, "https://tracker.example");
        assert_eq!(config.api.user_id, "default");
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.replay.interval_secs = 60;
        config.storage.data_dir = dir.path().join("data");
        config.save(Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.replay.interval_secs, 60);
        assert_eq!(loaded.storage.data_dir, dir.path().join("data"));
    }
}
