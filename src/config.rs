// Configuration management module
// Handles loading, saving, and validating configuration

use crate::engine::EngineOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between polls of the player
    pub poll_interval: u64,

    /// Seconds before a Last.fm request is abandoned
    pub request_timeout: u64,

    /// Application to follow, "Music" or "iTunes"
    pub player: String,

    /// Scrobble database, defaults to the user data directory
    pub database_path: Option<PathBuf>,

    /// Last.fm configuration
    pub lastfm: LastFmConfig,

    /// Backoff between failed submissions
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LastFmConfig {
    pub api_key: String,
    pub api_secret: String,
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Seconds before the first retry
    pub initial_interval: u64,
    /// Upper bound on the wait between retries, in seconds
    pub max_interval: u64,
}

impl Default for LastFmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            api_url: crate::scrobbler::lastfm::API_URL.to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: 30,
            max_interval: 30 * 60,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: 10,
            request_timeout: 30,
            player: "Music".to_string(),
            database_path: None,
            lastfm: LastFmConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?;

        Ok(config_dir.join("music_scrobbler.conf"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from file, or create default if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("Config file not found, creating default at {:?}", path);
            let default_config = Self::default();
            default_config.save_to(path)?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, content)
            .context("Failed to write config file")?;

        log::info!("Config saved to {:?}", path);

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval == 0 {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.request_timeout == 0 {
            anyhow::bail!("request_timeout must be greater than 0");
        }

        if self.player.trim().is_empty() {
            anyhow::bail!("player must name the application to follow");
        }

        if self.lastfm.api_url.is_empty() {
            anyhow::bail!("Last.fm api_url is required");
        }

        let retry = &self.retry;
        if retry.initial_interval == 0 || retry.max_interval < retry.initial_interval {
            anyhow::bail!("retry intervals must satisfy 0 < initial_interval <= max_interval");
        }

        if !self.has_credentials() {
            log::warn!("Last.fm api_key/api_secret are not set, scrobbles will only be queued");
        }

        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        !self.lastfm.api_key.is_empty() && !self.lastfm.api_secret.is_empty()
    }

    /// Where the scrobble database lives
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database_path {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?;

        Ok(data_dir.join("music-scrobbler").join("scrobbles.db"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            poll_interval: Duration::from_secs(self.poll_interval),
            retry_initial_interval: Duration::from_secs(self.retry.initial_interval),
            retry_max_interval: Duration::from_secs(self.retry.max_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("music_scrobbler.conf");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("music_scrobbler.conf");
        fs::write(
            &path,
            "player = \"iTunes\"\n\n[lastfm]\napi_key = \"key\"\napi_secret = \"secret\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.player, "iTunes");
        assert_eq!(config.poll_interval, 10);
        assert_eq!(config.lastfm.api_url, "https://ws.audioscrobbler.com/2.0/");
        assert!(config.has_credentials());
        assert_eq!(config.engine_options().retry_initial_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let config = Config {
            poll_interval: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("music_scrobbler.conf");
        fs::write(&path, "poll_interval = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_retry_bounds_are_checked() {
        let mut config = Config::default();
        config.retry.max_interval = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_path_override() {
        let config = Config {
            database_path: Some(PathBuf::from("/tmp/scrobbles.db")),
            ..Config::default()
        };
        assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/scrobbles.db"));
    }
}
