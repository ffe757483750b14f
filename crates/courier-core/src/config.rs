//! Courier configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CourierError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Base URL of the portal UI, used for inline action links in chat
    /// messages and sign-in links in mail. Absent disables action buttons.
    #[serde(default)]
    pub portal_url: Option<String>,
    #[serde(default)]
    pub mail: Option<MailConfig>,
    #[serde(default)]
    pub chat: Option<ChatConfig>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            portal_url: None,
            mail: None,
            chat: None,
            gateway: GatewayConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl CourierConfig {
    /// Load config from the default path (~/.courier/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CourierError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CourierError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CourierError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Courier home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".courier")
    }
}

/// SMTP mail channel configuration. Absent or without credentials means the
/// mail channel is skipped for all events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    /// Sender address, e.g. "portal@example.com".
    pub from_address: String,
    #[serde(default)]
    pub from_name: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

/// Chat-platform channel configuration. Absent or without a bot token means
/// the chat channel is skipped for all events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Concurrent sends per fan-out batch.
    #[serde(default = "default_batch_width")]
    pub batch_width: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://api.telegram.org".into()
}
fn default_batch_width() -> usize {
    5
}
fn default_connect_timeout() -> u64 {
    15
}

/// Webhook gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    /// Shared secret checked against the `secret` query parameter before any
    /// update parsing. Unset skips verification; configure one in any
    /// internet-facing deployment.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8380
}
fn default_webhook_path() -> String {
    "/webhook/chat".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            webhook_path: default_webhook_path(),
            webhook_secret: None,
        }
    }
}

/// Reference store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. Defaults to ~/.courier/courier.db.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    CourierConfig::home_dir()
        .join("courier.db")
        .to_string_lossy()
        .into_owned()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}
