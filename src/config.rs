use crate::{fetcher::DEFAULT_POLL_INTERVAL, steamdb::DEFAULT_BASE_URL};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub last_directory: Option<PathBuf>,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_history_base_url")]
    pub history_base_url: String,
    #[serde(default = "default_true")]
    pub confirm_actions: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            last_directory: None,
            platform: default_platform(),
            poll_interval_ms: default_poll_interval_ms(),
            history_base_url: default_history_base_url(),
            confirm_actions: true,
        }
    }
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let path = base_data_dir()?.join("config.json");
        Self::load_or_create_at(&path)
    }

    pub fn load_or_create_at(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save_to(path)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = base_data_dir()?.join("config.json");
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create app data dir")?;
        }
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub fn log_path() -> Result<PathBuf> {
    let base = base_data_dir()?;
    fs::create_dir_all(&base).context("create app data dir")?;
    Ok(base.join("sgub.log"))
}

fn default_platform() -> String {
    "Windows".to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_history_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("sgub"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "last_directory": "/games/steamapps" }"#).unwrap();

        let config = AppConfig::load_or_create_at(&path).unwrap();
        assert_eq!(config.last_directory, Some(PathBuf::from("/games/steamapps")));
        assert_eq!(config.platform, "Windows");
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.history_base_url, "https://steamdb.info");
        assert!(config.confirm_actions);
    }

    #[test]
    fn creates_and_reloads_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::load_or_create_at(&path).unwrap();
        assert!(path.exists());
        config.platform = "Linux".to_string();
        config.save_to(&path).unwrap();

        assert_eq!(AppConfig::load_or_create_at(&path).unwrap(), config);
    }
}
