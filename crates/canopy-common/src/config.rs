//! ---
//! canopy_section: "01-shared-runtime"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Console configuration model and TOML loader."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_owned()
}

fn default_ws_path() -> String {
    "/ws".to_owned()
}

fn default_reconnect_delay() -> Duration {
    Duration::from_millis(2000)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_watchdog_window() -> Duration {
    Duration::from_millis(5000)
}

fn default_debounce() -> Duration {
    Duration::from_millis(1000)
}

fn default_event_capacity() -> usize {
    256
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Top-level configuration for the operator console.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub autosave: AutosaveConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`ConsoleConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedConsoleConfig {
    pub config: ConsoleConfig,
    pub source: PathBuf,
}

impl ConsoleConfig {
    pub const ENV_CONFIG_PATH: &str = "CANOPY_CONFIG";

    /// Load configuration from disk, respecting the `CANOPY_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedConsoleConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedConsoleConfig {
                    config,
                    source: path,
                });
            }
        }

        let path = candidates
            .iter()
            .map(|candidate| candidate.as_ref())
            .find(|candidate| candidate.exists())
            .ok_or_else(|| {
                anyhow!(
                    "no configuration files found. inspected: {}",
                    candidates
                        .iter()
                        .map(|p| p.as_ref().display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })?;

        Ok(LoadedConsoleConfig {
            config: Self::from_path(path)?,
            source: path.to_path_buf(),
        })
    }

    /// Read and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<ConsoleConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.backend.validate()?;
        if self.watchdog.window.is_zero() {
            return Err(anyhow!("watchdog.window_ms must be greater than zero"));
        }
        if self.autosave.debounce.is_zero() {
            return Err(anyhow!("autosave.debounce_ms must be greater than zero"));
        }
        if self.events.capacity == 0 {
            return Err(anyhow!("events.capacity must be greater than zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for ConsoleConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: ConsoleConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Where the backend controller lives and how to reach it.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_reconnect_delay", rename = "reconnect_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_delay: Duration,
    #[serde(default = "default_request_timeout", rename = "request_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_path: default_ws_path(),
            reconnect_delay: default_reconnect_delay(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        self.http_url()?;
        if !self.ws_path.starts_with('/') {
            return Err(anyhow!(
                "backend.ws_path '{}' must start with '/'",
                self.ws_path
            ));
        }
        if self.reconnect_delay.is_zero() {
            return Err(anyhow!("backend.reconnect_delay_ms must be greater than zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("backend.request_timeout_ms must be greater than zero"));
        }
        Ok(())
    }

    /// Base URL of the HTTP request/response channel.
    pub fn http_url(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid backend.base_url '{}'", self.base_url))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(anyhow!(
                "backend.base_url must use http or https, found '{}'",
                other
            )),
        }
    }

    /// Streaming channel URL: `ws://` for `http://`, `wss://` for `https://`.
    pub fn websocket_url(&self) -> Result<Url> {
        let mut url = self.http_url()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| anyhow!("cannot derive websocket scheme from {}", self.base_url))?;
        url.set_path(&self.ws_path);
        url.set_query(None);
        Ok(url)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Silence longer than this marks the backend disconnected.
    #[serde(default = "default_watchdog_window", rename = "window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub window: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            window: default_watchdog_window(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutosaveConfig {
    #[serde(default = "default_debounce", rename = "debounce_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub debounce: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Buffered events per subscriber before it starts lagging.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Rolling file sink. Logs go to stderr only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}
