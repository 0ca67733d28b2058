//! Outbound device commands

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Command tag understood by device firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Ping,
    RequestLogs,
    ListImages,
    GetImage,
    GetImageMetadata,
    TakePhoto,
    GetSettings,
    SetSetting,
    OtaUpdate,
    CancelUpdate,
    GetStatus,
    SetAuto,
    SetHeater,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Ping => "ping",
            CommandKind::RequestLogs => "request_logs",
            CommandKind::ListImages => "list_images",
            CommandKind::GetImage => "get_image",
            CommandKind::GetImageMetadata => "get_image_metadata",
            CommandKind::TakePhoto => "take_photo",
            CommandKind::GetSettings => "get_settings",
            CommandKind::SetSetting => "set_setting",
            CommandKind::OtaUpdate => "ota_update",
            CommandKind::CancelUpdate => "cancel_update",
            CommandKind::GetStatus => "get_status",
            CommandKind::SetAuto => "set_auto",
            CommandKind::SetHeater => "set_heater",
        }
    }
}

/// A request sent to a device: `{"command": <kind>, ...fields}`.
///
/// The wire format has no correlation id; replies are matched by their
/// response type and, for image requests, the echoed filename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub command: CommandKind,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DeviceCommand {
    /// Create a command with no extra fields
    pub fn new(command: CommandKind) -> Self {
        Self {
            command,
            fields: Map::new(),
        }
    }

    /// Add a command-specific field
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Read a string field
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn ping() -> Self {
        Self::new(CommandKind::Ping)
    }

    pub fn request_logs() -> Self {
        Self::new(CommandKind::RequestLogs)
    }

    pub fn list_images() -> Self {
        Self::new(CommandKind::ListImages)
    }

    pub fn get_image(filename: &str) -> Self {
        Self::new(CommandKind::GetImage).with_field("filename", filename)
    }

    pub fn get_image_metadata(filename: &str) -> Self {
        Self::new(CommandKind::GetImageMetadata).with_field("filename", filename)
    }

    pub fn take_photo() -> Self {
        Self::new(CommandKind::TakePhoto)
    }

    pub fn get_settings() -> Self {
        Self::new(CommandKind::GetSettings)
    }

    pub fn set_setting(setting: &str, value: impl Into<Value>) -> Self {
        Self::new(CommandKind::SetSetting)
            .with_field("setting", setting)
            .with_field("value", value)
    }

    /// Hand the device a signed firmware download URL
    pub fn ota_update(url: &str, version: &str) -> Self {
        Self::new(CommandKind::OtaUpdate)
            .with_field("url", url)
            .with_field("version", version)
    }

    pub fn cancel_update() -> Self {
        Self::new(CommandKind::CancelUpdate)
    }

    pub fn get_status() -> Self {
        Self::new(CommandKind::GetStatus)
    }

    pub fn set_auto(enabled: bool) -> Self {
        Self::new(CommandKind::SetAuto).with_field("enabled", enabled)
    }

    pub fn set_heater(on: bool) -> Self {
        Self::new(CommandKind::SetHeater).with_field("on", on)
    }

    /// Serialize to the UTF-8 JSON wire form
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
