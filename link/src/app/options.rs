//! Application configuration options

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;

use crate::ble::gatt::DEFAULT_DEVICE_NAME;
use crate::errors::LinkError;
use crate::models::{CommandKind, Device, DeviceCommand, DeviceType};
use crate::storage::settings::Settings;

/// Which transport the CLI drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Bluetooth,
    Relay,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ble" | "bluetooth" => Ok(TransportKind::Bluetooth),
            "ws" | "websocket" | "relay" | "mqtt" => Ok(TransportKind::Relay),
            _ => Err(format!("Invalid transport: {}", s)),
        }
    }
}

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// List the project's devices and exit
    pub list_devices: bool,

    /// Project used for discovery and new device records
    pub project: String,

    pub transport: TransportKind,

    /// Target device
    pub device: Device,

    /// Query status once connected
    pub query_status: bool,

    /// Commands sent after connecting, in order
    pub commands: Vec<DeviceCommand>,

    /// How long to keep printing responses after the last command
    pub watch: Duration,

    /// Directory completed images are written to
    pub save_dir: Option<PathBuf>,

    pub settings: Settings,
}

impl AppOptions {
    /// Build options from `--key=value` arguments layered over `settings`
    pub fn from_args(args: &HashMap<String, String>, settings: Settings) -> Result<Self, LinkError> {
        let transport = match args.get("transport") {
            Some(value) => value.parse().map_err(LinkError::ConfigError)?,
            None => TransportKind::Bluetooth,
        };

        let project = args
            .get("project")
            .cloned()
            .unwrap_or_else(|| settings.api.project.clone());

        let device_type = args
            .get("device-type")
            .and_then(|t| t.parse::<DeviceType>().ok())
            .unwrap_or(DeviceType::Bootboots);

        let device_id = match (args.get("device"), transport) {
            (Some(id), _) => id.clone(),
            (None, TransportKind::Bluetooth) => DEFAULT_DEVICE_NAME.to_string(),
            (None, TransportKind::Relay) if !args.contains_key("list-devices") => {
                return Err(LinkError::ConfigError(
                    "--device=<thing name> is required for the relay transport".to_string(),
                ));
            }
            (None, TransportKind::Relay) => String::new(),
        };
        let device = Device::new(&device_id, &device_id, device_type).with_project(&project);

        let commands = match args.get("command") {
            Some(raw) => raw
                .split(';')
                .filter(|part| !part.trim().is_empty())
                .map(parse_command)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let watch = match args.get("watch") {
            Some(secs) => Duration::from_secs(
                secs.parse()
                    .map_err(|_| LinkError::ConfigError(format!("Invalid --watch value: {}", secs)))?,
            ),
            None => Duration::from_secs(5),
        };

        Ok(Self {
            list_devices: args.contains_key("list-devices"),
            project,
            transport,
            device,
            query_status: args.contains_key("status"),
            commands,
            watch,
            save_dir: args.get("save-dir").map(PathBuf::from),
            settings,
        })
    }
}

/// Parse a command given as JSON (`{"command":"get_image","filename":"a.jpg"}`)
/// or as a bare kind (`take_photo`)
pub fn parse_command(raw: &str) -> Result<DeviceCommand, LinkError> {
    let raw = raw.trim();
    if raw.starts_with('{') {
        return serde_json::from_str(raw)
            .map_err(|e| LinkError::ConfigError(format!("Invalid command {}: {}", raw, e)));
    }
    let kind: CommandKind = serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| LinkError::ConfigError(format!("Unknown command: {}", raw)))?;
    Ok(DeviceCommand::new(kind))
}
