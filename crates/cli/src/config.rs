//! Configuration loading from toolhub.toml.
//!
//! Every key is optional. API keys left out of the file are taken from the
//! environment (`OPENWEATHER_API_KEY`, `OPENAI_API_KEY`), which may in turn
//! come from a `.env` file.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use capabilities::{TranslatorConfig, WeatherConfig, ppt, sql, weather};
use runtime::{ConnectOptions, DEFAULT_REGISTRY_FILE, SupervisorOptions, ports::DEFAULT_SCAN_LIMIT};
use serde::Deserialize;

/// Looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "toolhub.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface the tool servers bind to and clients connect to.
    pub host: IpAddr,
    /// Registry file written by `servers` and read by `client`.
    pub registry: PathBuf,
    pub supervisor: SupervisorSection,
    pub client: ClientSection,
    pub weather: WeatherSection,
    pub sql: SqlSection,
    pub translator: TranslatorSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            registry: PathBuf::from(DEFAULT_REGISTRY_FILE),
            supervisor: SupervisorSection::default(),
            client: ClientSection::default(),
            weather: WeatherSection::default(),
            sql: SqlSection::default(),
            translator: TranslatorSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub ready_timeout_secs: u64,
    pub grace_period_secs: u64,
    pub port_scan_limit: u16,
    /// First preferred port of the built-in servers (default 8001, 8002, 8003).
    pub base_port: Option<u16>,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 10,
            grace_period_secs: 5,
            port_scan_limit: DEFAULT_SCAN_LIMIT,
            base_port: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub connect_timeout_secs: u64,
    /// Translating a large deck takes a while.
    pub call_timeout_secs: u64,
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 2,
            call_timeout_secs: 300,
            connect_attempts: 3,
            retry_delay_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherSection {
    pub api_base: String,
    pub api_key: Option<String>,
    pub user_agent: Option<String>,
    pub units: String,
    pub timeout_secs: u64,
}

impl Default for WeatherSection {
    fn default() -> Self {
        Self {
            api_base: weather::DEFAULT_API_BASE.to_string(),
            api_key: None,
            user_agent: None,
            units: "metric".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqlSection {
    /// SQLite database file, opened read-only.
    pub database: PathBuf,
    pub max_rows: usize,
}

impl Default for SqlSection {
    fn default() -> Self {
        Self {
            database: PathBuf::from("sales.db"),
            max_rows: sql::DEFAULT_MAX_ROWS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranslatorSection {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_file_bytes: usize,
    /// Limit on the decompressed size of an uploaded presentation.
    pub max_expanded_bytes: usize,
    pub timeout_secs: u64,
}

impl Default for TranslatorSection {
    fn default() -> Self {
        Self {
            api_base: ppt::DEFAULT_API_BASE.to_string(),
            api_key: None,
            model: ppt::DEFAULT_MODEL.to_string(),
            max_file_bytes: ppt::DEFAULT_MAX_FILE_BYTES,
            max_expanded_bytes: ppt::DEFAULT_MAX_EXPANDED_BYTES,
            timeout_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `toolhub.toml` in the
    /// working directory is used if present, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::read(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::read(Path::new(DEFAULT_CONFIG_FILE))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Fill unset secrets from the environment.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        if self.weather.api_key.is_none() {
            self.weather.api_key = non_empty("OPENWEATHER_API_KEY");
        }
        if self.translator.api_key.is_none() {
            self.translator.api_key = non_empty("OPENAI_API_KEY");
        }
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            host: self.host,
            ready_timeout: Duration::from_secs(self.supervisor.ready_timeout_secs),
            grace_period: Duration::from_secs(self.supervisor.grace_period_secs),
            port_scan_limit: self.supervisor.port_scan_limit,
            ..SupervisorOptions::default()
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: Duration::from_secs(self.client.connect_timeout_secs),
            call_timeout: Duration::from_secs(self.client.call_timeout_secs),
            attempts: self.client.connect_attempts,
            retry_delay: Duration::from_millis(self.client.retry_delay_ms),
        }
    }

    pub fn weather_config(&self) -> WeatherConfig {
        let defaults = WeatherConfig::default();
        WeatherConfig {
            api_base: self.weather.api_base.clone(),
            api_key: self.weather.api_key.clone(),
            user_agent: self.weather.user_agent.clone().unwrap_or(defaults.user_agent),
            units: self.weather.units.clone(),
            timeout: Duration::from_secs(self.weather.timeout_secs),
        }
    }

    pub fn translator_config(&self) -> TranslatorConfig {
        TranslatorConfig {
            api_base: self.translator.api_base.clone(),
            api_key: self.translator.api_key.clone(),
            model: self.translator.model.clone(),
            timeout: Duration::from_secs(self.translator.timeout_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),
}
