//! Application configuration management.
//!
//! Two layers live here:
//! - `SessionConfig`: the timing rules of the session lifecycle (window
//!   length, refresh and warning lead times). Defaults are the production
//!   values and rarely need changing.
//! - `Config`: where the portal lives and where session metadata is kept.
//!   Stored at `~/.config/queuedesk/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/storage directory paths
pub const APP_NAME: &str = "queuedesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable that overrides `portal_url`
const PORTAL_URL_ENV: &str = "QUEUEDESK_PORTAL_URL";

/// Portal used when nothing is configured.
const DEFAULT_PORTAL_URL: &str = "http://localhost:3000";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// A login session is capped at 10 hours regardless of refresh activity.
const SESSION_WINDOW_HOURS: u64 = 10;

/// Refresh the access token this long before it expires.
const REFRESH_LEAD_SECS: u64 = 45;

/// Show the expiry warning this long before the session ceiling.
const WARNING_LEAD_SECS: u64 = 122;

/// No timer is ever armed with a shorter delay than this.
const MIN_TIMER_DELAY_MS: u64 = 1_000;

/// Timing rules for a login session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub window: Duration,
    pub refresh_lead: Duration,
    pub warning_lead: Duration,
    pub min_timer_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(SESSION_WINDOW_HOURS * 60 * 60),
            refresh_lead: Duration::from_secs(REFRESH_LEAD_SECS),
            warning_lead: Duration::from_secs(WARNING_LEAD_SECS),
            min_timer_delay: Duration::from_millis(MIN_TIMER_DELAY_MS),
        }
    }
}

impl SessionConfig {
    pub fn window_ms(&self) -> i64 {
        duration_ms(self.window)
    }

    pub fn refresh_lead_ms(&self) -> i64 {
        duration_ms(self.refresh_lead)
    }

    pub fn warning_lead_ms(&self) -> i64 {
        duration_ms(self.warning_lead)
    }

    pub fn min_timer_delay_ms(&self) -> i64 {
        duration_ms(self.min_timer_delay)
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Where session metadata survives restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// `session.json` in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
    /// Process memory only; nothing survives a restart
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_portal_url")]
    pub portal_url: String,
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_portal_url() -> String {
    DEFAULT_PORTAL_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            portal_url: default_portal_url(),
            storage: StorageKind::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    /// Load the config file (defaults when absent), then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(PORTAL_URL_ENV) {
            if !url.trim().is_empty() {
                self.portal_url = url.trim().to_string();
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the persisted session anchor.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
