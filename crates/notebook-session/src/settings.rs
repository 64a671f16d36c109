//! Client settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/notebook-session/settings.json
//! - Linux: ~/.config/notebook-session/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\notebook-session\settings.json
//!
//! Environment variables override the file; command-line flags override both
//! (applied by the binary).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_URL_ENV: &str = "NOTEBOOK_SESSION_API_URL";
pub const TOKEN_ENV: &str = "NOTEBOOK_SESSION_TOKEN";

pub const DEFAULT_API_URL: &str = "http://localhost:8888/api";
pub const DEFAULT_KERNEL: &str = "python3";

/// Connection and polling preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Base URL of the server's REST API, including the `/api` prefix
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Server token, sent as `Authorization: token <token>` when non-empty
    #[serde(default)]
    pub token: String,

    /// Kernelspec started when no language is given
    #[serde(default = "default_kernel")]
    pub default_kernel: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Per-request timeout. Unset means no client-side timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_kernel() -> String {
    DEFAULT_KERNEL.to_string()
}

fn default_poll_interval() -> u64 {
    5
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: String::new(),
            default_kernel: default_kernel(),
            poll_interval_secs: default_poll_interval(),
            request_timeout_secs: None,
        }
    }
}

impl ClientSettings {
    /// Settings from disk with environment overrides applied.
    pub fn resolve() -> Self {
        let mut settings = load_settings();
        settings.apply_env_overrides();
        settings
    }

    /// Apply `NOTEBOOK_SESSION_API_URL` / `NOTEBOOK_SESSION_TOKEN`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_url = url.trim().to_string();
            }
        }
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            self.token = token;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        // A zero interval would make tokio's interval panic.
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("notebook-session")
        .join("settings.json")
}

/// Load settings from disk, returning defaults if file doesn't exist
pub fn load_settings() -> ClientSettings {
    load_settings_from(&settings_path())
}

/// Load settings from a specific file. Unreadable or malformed files fall
/// back to defaults.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        ClientSettings::default()
    }
}

/// Save settings to disk
pub fn save_settings(settings: &ClientSettings) -> Result<()> {
    save_settings_to(&settings_path(), settings)
}

pub fn save_settings_to(path: &Path, settings: &ClientSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
