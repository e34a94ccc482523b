//! Persistent settings for remote interrupts.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/remote-interrupt/settings.json
//! - Linux: ~/.config/remote-interrupt/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\remote-interrupt\settings.json
//!
//! Environment variables override the file; command line flags override both.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::dispatch::DEFAULT_REQUEST_TIMEOUT;
use crate::identity::{AddressingScheme, DEFAULT_REMOTE_MARKER};
use crate::resolver::DEFAULT_INTROSPECTION_TIMEOUT;
use crate::tracker::{TrackerConfig, DEFAULT_READY_TIMEOUT, DEFAULT_SETTLE_DELAY};

pub const BASE_URL_ENV: &str = "REMOTE_INTERRUPT_BASE_URL";
pub const TOKEN_ENV: &str = "JUPYTER_TOKEN";
pub const SCHEME_ENV: &str = "REMOTE_INTERRUPT_SCHEME";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8888/";

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_remote_marker() -> String {
    DEFAULT_REMOTE_MARKER.to_string()
}

fn default_settle_delay_ms() -> u64 {
    DEFAULT_SETTLE_DELAY.as_millis() as u64
}

fn default_use_readiness_probe() -> bool {
    true
}

fn default_ready_timeout_secs() -> u64 {
    DEFAULT_READY_TIMEOUT.as_secs()
}

fn default_introspection_timeout_secs() -> u64 {
    DEFAULT_INTROSPECTION_TIMEOUT.as_secs()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

/// Remote interrupt settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Notebook server base URL, the endpoint is `<base_url>/interrupt`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Server token sent as `Authorization: token <token>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// How kernels are addressed on the interrupt endpoint
    #[serde(default)]
    pub scheme: AddressingScheme,

    /// Display-name prefix of remote kernels
    #[serde(default = "default_remote_marker")]
    pub remote_marker: String,

    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Ping the kernel heartbeat before falling back to `settle_delay_ms`
    #[serde(default = "default_use_readiness_probe")]
    pub use_readiness_probe: bool,

    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    #[serde(default = "default_introspection_timeout_secs")]
    pub introspection_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            scheme: AddressingScheme::default(),
            remote_marker: default_remote_marker(),
            settle_delay_ms: default_settle_delay_ms(),
            use_readiness_probe: default_use_readiness_probe(),
            ready_timeout_secs: default_ready_timeout_secs(),
            introspection_timeout_secs: default_introspection_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Settings {
    /// Load from `path` (or the default location), then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).unwrap_or_else(settings_path);
        let mut settings = load_settings_from(&path);
        settings.apply_env();
        settings
    }

    /// Apply `REMOTE_INTERRUPT_BASE_URL`, `JUPYTER_TOKEN` and
    /// `REMOTE_INTERRUPT_SCHEME`.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(base_url) = lookup(BASE_URL_ENV) {
            debug!("[settings] base_url from {}", BASE_URL_ENV);
            self.base_url = base_url;
        }
        if let Some(token) = lookup(TOKEN_ENV) {
            debug!("[settings] token from {}", TOKEN_ENV);
            self.token = Some(token);
        }
        if let Some(scheme) = lookup(SCHEME_ENV) {
            match scheme.parse() {
                Ok(scheme) => self.scheme = scheme,
                Err(e) => warn!("[settings] Ignoring {}: {}", SCHEME_ENV, e),
            }
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn introspection_timeout(&self) -> Duration {
        Duration::from_secs(self.introspection_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            settle_delay: self.settle_delay(),
            ready_timeout: self.ready_timeout(),
            use_readiness_probe: self.use_readiness_probe,
        }
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("remote-interrupt")
        .join("settings.json")
}

/// Load settings from `path`, returning defaults if the file doesn't exist
/// or can't be parsed
pub fn load_settings_from(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(
                "[settings] Ignoring unreadable settings {}: {}",
                path.display(),
                e
            );
            Settings::default()
        }),
        Err(e) => {
            warn!("[settings] Failed to read {}: {}", path.display(), e);
            Settings::default()
        }
    }
}

/// Save settings to `path`
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
