//! # Configuration
//!
//! TOML configuration for the terminal and for the scanner.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_HUB_PORT=8765                                                │
//! │     TALLY_DEVICE_NAME="Phone A"                                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally-pos/terminal.toml | scanner.toml (Linux)           │
//! │     ~/Library/Application Support/com.tally.pos/... (macOS)            │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Terminal File
//! ```toml
//! [hub]
//! port = 8765
//! bind_addr = "0.0.0.0"
//!
//! [database]
//! path = "/var/lib/tally/terminal.db"
//!
//! [terminal]
//! default_cart_name = "Mostrador"
//! ```
//!
//! ## Scanner File
//! ```toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"   # written after registration
//! name = "Phone A"
//!
//! [transport]
//! hub_url = "ws://192.168.1.10:8765/ws"
//! settle_ms = 1500
//!
//! [pairing]
//! base_url = "http://192.168.1.10:8765"
//! heartbeat_interval_secs = 30
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use tally_core::validation::{validate_cart_name, validate_device_id, validate_device_name};
use tally_core::DEFAULT_CART_NAME;

use crate::error::{SyncError, SyncResult};
use crate::hub::HubConfig;
use crate::transport::TransportConfig;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "tally";
const APPLICATION: &str = "pos";

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

fn read_toml<T: serde::de::DeserializeOwned + Default>(path: Option<PathBuf>) -> SyncResult<T> {
    match path {
        Some(path) if path.exists() => {
            info!(?path, "Loading config from file");
            let contents = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&contents)?)
        }
        Some(path) => {
            debug!(?path, "Config file not found, using defaults");
            Ok(T::default())
        }
        None => Ok(T::default()),
    }
}

fn write_toml<T: Serialize>(value: &T, path: Option<PathBuf>) -> SyncResult<PathBuf> {
    let path = path.ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(value)?;
    std::fs::write(&path, contents)?;

    info!(?path, "Config saved");
    Ok(path)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = %key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

// =============================================================================
// Transport Settings (shared)
// =============================================================================

/// Reconnect policy for a channel client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// WebSocket URL of the hub. Unused by the terminal, which sits on the
    /// broker in-process.
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Wait between a reconnect request and the single retried send.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Set to 0 for infinite retries.
    #[serde(default)]
    pub max_retries: u32,
}

fn default_hub_url() -> String {
    "ws://127.0.0.1:8765/ws".to_string()
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_settle_ms() -> u64 {
    1500
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            hub_url: default_hub_url(),
            connect_timeout_secs: default_connect_timeout(),
            settle_ms: default_settle_ms(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_retries: 0,
        }
    }
}

impl TransportSettings {
    pub fn to_transport_config(&self, label: &str) -> TransportConfig {
        TransportConfig {
            label: label.to_string(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            max_retries: self.max_retries,
            ..Default::default()
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    fn validate(&self) -> SyncResult<()> {
        let url = Url::parse(&self.hub_url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidUrl(format!(
                "Hub URL must start with ws:// or wss://, got: {}",
                self.hub_url
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Terminal Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("terminal.db"))
        .unwrap_or_else(|| PathBuf::from("terminal.db"))
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSettings {
    /// Name of the cart created at first start and whenever the last cart
    /// is deleted.
    #[serde(default = "default_cart_name")]
    pub default_cart_name: String,
}

fn default_cart_name() -> String {
    DEFAULT_CART_NAME.to_string()
}

impl Default for TerminalSettings {
    fn default() -> Self {
        TerminalSettings {
            default_cart_name: default_cart_name(),
        }
    }
}

/// Complete terminal configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub terminal: TerminalSettings,

    #[serde(default)]
    pub transport: TransportSettings,
}

impl TerminalConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (terminal.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config: Self = read_toml(config_path.or_else(Self::default_config_path))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load terminal config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        write_toml(self, config_path.or_else(Self::default_config_path)).map(|_| ())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.hub.port == 0 {
            return Err(SyncError::InvalidConfig("hub.port must not be 0".into()));
        }
        validate_cart_name(&self.terminal.default_cart_name)
            .map_err(|e| SyncError::InvalidConfig(format!("terminal.default_cart_name: {}", e)))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(port) = env_parse::<u16>("TALLY_HUB_PORT") {
            debug!(port, "Overriding hub port from environment");
            self.hub.port = port;
        }

        if let Ok(addr) = std::env::var("TALLY_BIND_ADDR") {
            self.hub.bind_addr = addr;
        }

        if let Ok(path) = std::env::var("TALLY_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(name) = std::env::var("TALLY_DEFAULT_CART_NAME") {
            self.terminal.default_cart_name = name;
        }
    }

    pub fn default_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("terminal.toml"))
    }
}

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Identity of this scanner. `id` is absent until the first registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Scanner".to_string()
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            id: None,
            name: default_device_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSettings {
    /// HTTP base URL of the terminal's hub.
    #[serde(default = "default_pairing_url")]
    pub base_url: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_pairing_url() -> String {
    "http://127.0.0.1:8765".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

impl Default for PairingSettings {
    fn default() -> Self {
        PairingSettings {
            base_url: default_pairing_url(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

/// Complete scanner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub pairing: PairingSettings,
}

impl ScannerConfig {
    /// Same load order as [`TerminalConfig::load`].
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config: Self = read_toml(config_path.or_else(Self::default_config_path))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load scanner config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Persists the config, including the device identity.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        write_toml(self, config_path.or_else(Self::default_config_path)).map(|_| ())
    }

    pub fn validate(&self) -> SyncResult<()> {
        validate_device_name(&self.device.name)
            .map_err(|e| SyncError::InvalidConfig(format!("device.name: {}", e)))?;

        if let Some(ref id) = self.device.id {
            validate_device_id(id)
                .map_err(|e| SyncError::InvalidConfig(format!("device.id: {}", e)))?;
        }

        self.transport.validate()?;

        let base = Url::parse(&self.pairing.base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "Pairing URL must start with http:// or https://, got: {}",
                self.pairing.base_url
            )));
        }

        if self.pairing.heartbeat_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "heartbeat_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("TALLY_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = Some(id);
        }

        if let Ok(name) = std::env::var("TALLY_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(url) = std::env::var("TALLY_HUB_URL") {
            debug!(url = %url, "Overriding hub URL from environment");
            self.transport.hub_url = url;
        }

        if let Ok(url) = std::env::var("TALLY_PAIRING_URL") {
            self.pairing.base_url = url;
        }

        if let Some(ms) = env_parse::<u64>("TALLY_SETTLE_MS") {
            self.transport.settle_ms = ms;
        }
    }

    pub fn default_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("scanner.toml"))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.pairing.heartbeat_interval_secs)
    }
}
