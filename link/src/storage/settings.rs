//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ble::{BluetoothOptions, BtleplugOptions};
use crate::cache::DEFAULT_CAPACITY;
use crate::chunking::ChunkOptions;
use crate::errors::LinkError;
use crate::filesys::file::File;
use crate::http::DEFAULT_PROJECT;
use crate::logs::{LogLevel, LogOptions};
use crate::transport::STATUS_TIMEOUT;
use crate::ws::WebSocketOptions;

/// Client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Directory for a daily rolling log file
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Cloud API configuration
    #[serde(default)]
    pub api: ApiSettings,

    /// WebSocket relay configuration
    #[serde(default)]
    pub relay: RelaySettings,

    /// Bluetooth configuration
    #[serde(default)]
    pub bluetooth: BluetoothSettings,

    /// Images kept in the in-memory cache
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            log_json: false,
            api: ApiSettings::default(),
            relay: RelaySettings::default(),
            bluetooth: BluetoothSettings::default(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Settings {
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            log_level: self.log_level.clone(),
            stderr: true,
            log_dir: self.log_dir.clone(),
            json_format: self.log_json,
        }
    }
}

/// Cloud API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Base URL for the device API
    #[serde(default = "default_api_url")]
    pub base_url: String,

    /// Project listed by default
    #[serde(default = "default_project")]
    pub project: String,
}

fn default_api_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_project() -> String {
    DEFAULT_PROJECT.to_string()
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: default_api_url(),
            project: default_project(),
        }
    }
}

/// WebSocket relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Relay endpoint (`ws://`, `wss://`, or the `http(s)://` equivalent)
    #[serde(default = "default_relay_url")]
    pub url: String,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Keep-alive interval, disabled when absent
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,
}

fn default_relay_url() -> String {
    "ws://localhost:3001".to_string()
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_secs: None,
        }
    }
}

impl RelaySettings {
    pub fn websocket_options(&self) -> WebSocketOptions {
        WebSocketOptions {
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_interval: self.heartbeat_interval_secs.map(Duration::from_secs),
            ..WebSocketOptions::default()
        }
    }
}

/// Bluetooth settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothSettings {
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_status_timeout_ms")]
    pub status_timeout_ms: u64,

    /// Pause between outbound chunks
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,

    #[serde(default = "default_true")]
    pub read_status_on_connect: bool,
}

fn default_scan_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_status_timeout_ms() -> u64 {
    STATUS_TIMEOUT.as_millis() as u64
}

fn default_chunk_delay_ms() -> u64 {
    50
}

impl Default for BluetoothSettings {
    fn default() -> Self {
        Self {
            scan_timeout_secs: default_scan_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            status_timeout_ms: default_status_timeout_ms(),
            chunk_delay_ms: default_chunk_delay_ms(),
            read_status_on_connect: true,
        }
    }
}

impl BluetoothSettings {
    pub fn adapter_options(&self) -> BtleplugOptions {
        BtleplugOptions {
            scan_timeout: Duration::from_secs(self.scan_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..BtleplugOptions::default()
        }
    }

    pub fn bluetooth_options(&self) -> BluetoothOptions {
        BluetoothOptions {
            chunking: ChunkOptions {
                inter_chunk_delay: Duration::from_millis(self.chunk_delay_ms),
                ..ChunkOptions::default()
            },
            status_timeout: Duration::from_millis(self.status_timeout_ms),
            read_status_on_connect: self.read_status_on_connect,
            ..BluetoothOptions::default()
        }
    }
}

/// Load settings from file, falling back to defaults when it does not exist
pub async fn load_settings(settings_file: &File) -> Result<Settings, LinkError> {
    if !settings_file.exists().await {
        debug!("No settings at {}, using defaults", settings_file.path().display());
        return Ok(Settings::default());
    }
    settings_file
        .read_json()
        .await
        .map_err(|e| LinkError::ConfigError(format!("Failed to read {}: {}", settings_file.path().display(), e)))
}

/// Save settings to file
pub async fn save_settings(settings_file: &File, settings: &Settings) -> Result<(), LinkError> {
    settings_file.write_json(settings).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings() {
        let settings: Settings = serde_json::from_str(
            r#"{"log_level":"debug","relay":{"url":"wss://relay.example.com","max_reconnect_attempts":3}}"#,
        )
        .unwrap();
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.relay.max_reconnect_attempts, 3);
        assert_eq!(settings.relay.reconnect_base_delay_ms, 1000);
        assert_eq!(settings.bluetooth.chunk_delay_ms, 50);
        assert_eq!(settings.cache_capacity, 20);
        assert_eq!(settings.api.project, "catcam");
    }

    #[test]
    fn test_options_conversion() {
        let settings = Settings::default();
        let ws = settings.relay.websocket_options();
        assert_eq!(ws.reconnect_base_delay, Duration::from_millis(1000));
        assert_eq!(ws.max_reconnect_attempts, 5);
        assert!(ws.heartbeat_interval.is_none());

        let ble = settings.bluetooth.bluetooth_options();
        assert_eq!(ble.status_timeout, Duration::from_secs(5));
        assert_eq!(ble.chunking.inter_chunk_delay, Duration::from_millis(50));
        assert_eq!(ble.chunking.max_single_packet, 512);
    }

    #[tokio::test]
    async fn test_load_missing_file_defaults() {
        let path = std::env::temp_dir().join(format!("bootlink-{}.json", uuid::Uuid::new_v4()));
        let settings = load_settings(&File::new(path)).await.unwrap();
        assert_eq!(settings.cache_capacity, DEFAULT_CAPACITY);
    }
}
