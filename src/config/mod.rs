//! Configuration module
//!
//! [`Settings`] is the supervisor's own YAML configuration (subscription,
//! ports, timeouts, paths). [`engine`] builds the JSON document handed to
//! the engine process for each attempt.

pub mod engine;

pub use engine::{TunnelConfig, TunnelConfigBuilder};

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Environment variable overriding `subscription-url`
pub const SUBSCRIPTION_URL_ENV: &str = "GEOTUNNEL_SUBSCRIPTION_URL";

/// Local SOCKS listener port
pub const DEFAULT_SOCKS_PORT: u16 = 10808;

/// Candidates tried per acquisition
pub const DEFAULT_MAX_CANDIDATES: usize = 10;

/// Upstream Xray release downloads
pub const DEFAULT_RELEASE_URL: &str = "https://github.com/XTLS/Xray-core/releases/latest/download";

/// Longest engine name the stray sweep can see (Linux `comm` limit)
pub const MAX_ENGINE_NAME_LEN: usize = 15;

const DATA_DIR_NAME: &str = ".geotunnel";
const CACHE_FILE_NAME: &str = "subscription_cache.txt";

/// Supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Subscription URL (base64 or plain list of links)
    pub subscription_url: String,

    /// Per-user state directory (engine binary, cache, engine log)
    pub data_dir: Option<PathBuf>,

    /// Local SOCKS listener port
    pub socks_port: u16,

    /// Local SOCKS listener address
    pub listen: String,

    /// Number of subscription candidates tried per acquisition
    pub max_candidates: usize,

    /// Subscription fetch timeout (seconds)
    pub fetch_timeout: u64,

    /// Engine archive download timeout (seconds)
    pub download_timeout: u64,

    /// Wait between launching the engine and probing it (milliseconds)
    pub settle_delay: u64,

    /// Graceful stop timeout before the engine is killed (seconds)
    pub stop_timeout: u64,

    /// Pause after killing stray engines so their port is released (milliseconds)
    pub sweep_delay: u64,

    /// Engine log level
    pub engine_log_level: String,

    /// Base URL of engine release archives
    pub engine_release_url: String,

    /// Engine executable stem (`xray` -> `xray` / `xray.exe`)
    pub engine_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            subscription_url: String::new(),
            data_dir: None,
            socks_port: DEFAULT_SOCKS_PORT,
            listen: "127.0.0.1".to_string(),
            max_candidates: DEFAULT_MAX_CANDIDATES,
            fetch_timeout: 10,
            download_timeout: 60,
            settle_delay: 4000,
            stop_timeout: 5,
            sweep_delay: 1000,
            engine_log_level: "warning".to_string(),
            engine_release_url: DEFAULT_RELEASE_URL.to_string(),
            engine_name: "xray".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file, then apply environment overrides
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let mut settings = Self::from_yaml(&content)?;
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `path` if it exists, otherwise start from defaults
    pub async fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(path) if path.as_ref().exists() => Self::load(path).await,
            Some(path) => Err(Error::config(format!(
                "settings file not found: {}",
                path.as_ref().display()
            ))),
            None => {
                let mut settings = Settings::default();
                settings.apply_env();
                Ok(settings)
            }
        }
    }

    /// Parse from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Settings::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `GEOTUNNEL_SUBSCRIPTION_URL`
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(SUBSCRIPTION_URL_ENV) {
            if !url.trim().is_empty() {
                self.subscription_url = url.trim().to_string();
            }
        }
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if !self.subscription_url.is_empty() {
            url::Url::parse(&self.subscription_url).map_err(|e| {
                Error::config(format!(
                    "invalid subscription url '{}': {}",
                    self.subscription_url, e
                ))
            })?;
        }
        match self.listen.parse::<std::net::IpAddr>() {
            Ok(ip) if ip.is_loopback() => {}
            _ => {
                return Err(Error::config(format!(
                    "listen must be a loopback IP address, got '{}'",
                    self.listen
                )))
            }
        }
        if self.socks_port == 0 {
            return Err(Error::config("socks-port cannot be 0"));
        }
        if self.max_candidates == 0 {
            return Err(Error::config("max-candidates cannot be 0"));
        }
        if self.engine_name.trim().is_empty() {
            return Err(Error::config("engine-name cannot be empty"));
        }
        if self.engine_name.len() > MAX_ENGINE_NAME_LEN {
            return Err(Error::config(format!(
                "engine-name '{}' is longer than {} bytes",
                self.engine_name, MAX_ENGINE_NAME_LEN
            )));
        }
        Ok(())
    }

    /// Resolved per-user state directory
    pub fn data_dir(&self) -> PathBuf {
        match self.data_dir {
            Some(ref dir) => dir.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(DATA_DIR_NAME),
        }
    }

    /// Engine executable file name for the host OS
    pub fn engine_file_name(&self) -> String {
        if cfg!(windows) {
            format!("{}.exe", self.engine_name)
        } else {
            self.engine_name.clone()
        }
    }

    /// Path of the engine executable
    pub fn engine_path(&self) -> PathBuf {
        self.data_dir().join(self.engine_file_name())
    }

    /// Path of the subscription cache
    pub fn cache_path(&self) -> PathBuf {
        self.data_dir().join(CACHE_FILE_NAME)
    }

    /// Path the engine writes its error log to
    pub fn engine_log_path(&self) -> PathBuf {
        self.data_dir().join(format!("{}.log", self.engine_name))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }

    pub fn sweep_delay(&self) -> Duration {
        Duration::from_millis(self.sweep_delay)
    }

    /// Save settings to file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}
