//! Inbound device frames and the logical responses built from them

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::LinkError;

/// MIME prefix for reassembled JPEG images
pub const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

// ================================= WIRE FRAMES =================================== //

/// One physical frame sent by the device, classified by its `type` tag
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Pong,
    LogChunk(ChunkFrame),
    LogsComplete(CompleteFrame),
    ImageListChunk(ImageListChunkFrame),
    ImageListComplete(CompleteFrame),
    ImageStart(ImageStartFrame),
    ImageChunk(ChunkFrame),
    ImageComplete(CompleteFrame),
    MetadataResult(MetadataFrame),
    Settings(SettingsFrame),
    SettingUpdated(SettingUpdatedFrame),
    Error(ErrorFrame),
    Status(StatusFrame),
}

/// Frame types with a dedicated [`Frame`] variant
const KNOWN_FRAME_TYPES: &[&str] = &[
    "pong",
    "log_chunk",
    "logs_complete",
    "image_list_chunk",
    "image_list_complete",
    "image_start",
    "image_chunk",
    "image_complete",
    "metadata_result",
    "settings",
    "setting_updated",
    "error",
    "status",
];

/// A numbered piece of a text or base64 payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChunkFrame {
    #[serde(default, alias = "chunk_index")]
    pub chunk: Option<u32>,

    #[serde(default, alias = "total_chunks")]
    pub total: Option<u32>,

    #[serde(default)]
    pub data: String,

    #[serde(default)]
    pub filename: Option<String>,
}

/// Terminates a chunked transfer
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompleteFrame {
    #[serde(default)]
    pub filename: Option<String>,

    #[serde(default, alias = "total_chunks", alias = "chunks")]
    pub total: Option<u32>,

    /// Payload encoding hint, `"json"` for log arrays
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageListChunkFrame {
    #[serde(default, alias = "chunk_index")]
    pub chunk: Option<u32>,

    #[serde(default, alias = "total_chunks")]
    pub total: Option<u32>,

    #[serde(default)]
    pub images: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageStartFrame {
    pub filename: String,

    #[serde(default)]
    pub size: Option<u64>,

    #[serde(default, alias = "total_chunks")]
    pub total: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetadataFrame {
    pub filename: String,

    #[serde(default)]
    pub metadata: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SettingsFrame {
    #[serde(default)]
    pub settings: Option<Map<String, Value>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SettingUpdatedFrame {
    pub setting: String,

    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorFrame {
    #[serde(default, alias = "error")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusFrame {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Result of classifying one physical frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(Frame),

    /// Bare JSON array: a complete log payload without a `type` wrapper
    LegacyLogs(Vec<Value>),

    /// Object with a `type` this client has no variant for
    Unknown { kind: String, body: Map<String, Value> },
}

/// Decode and classify a UTF-8 JSON frame.
///
/// Objects are classified by `type`, falling back to the older `response`
/// field (`{"response": "pong"}`). Arrays are checked first and treated as
/// legacy log payloads.
pub fn parse_frame(bytes: &[u8]) -> Result<Inbound, LinkError> {
    let value: Value = serde_json::from_slice(bytes)?;
    parse_value(value)
}

/// Classify an already-decoded frame
pub fn parse_value(value: Value) -> Result<Inbound, LinkError> {
    let mut map = match value {
        Value::Array(items) => return Ok(Inbound::LegacyLogs(items)),
        Value::Object(map) => map,
        other => {
            return Err(LinkError::ProtocolError(format!(
                "Expected JSON object or array, got {}",
                other
            )))
        }
    };

    if !map.contains_key("type") {
        if let Some(response) = map.get("response").and_then(Value::as_str) {
            let kind = response.to_string();
            map.insert("type".to_string(), Value::String(kind));
        }
    }

    let kind = match map.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(LinkError::ProtocolError("Frame has no type".to_string())),
    };

    if !KNOWN_FRAME_TYPES.contains(&kind.as_str()) {
        map.remove("type");
        return Ok(Inbound::Unknown { kind, body: map });
    }

    let frame = serde_json::from_value(Value::Object(map))
        .map_err(|e| LinkError::ProtocolError(format!("Malformed {} frame: {}", kind, e)))?;
    Ok(Inbound::Frame(frame))
}

// ============================== LOGICAL RESPONSES ================================ //

/// Reassembled log output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LogPayload {
    Lines(Vec<String>),
    Text(String),
}

/// One entry of an image listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub filename: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl ImageEntry {
    /// Accept either a bare filename or an object with `filename`/`name`
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(name) => Some(Self {
                filename: name.clone(),
                size: None,
            }),
            Value::Object(obj) => {
                let filename = obj
                    .get("filename")
                    .or_else(|| obj.get("name"))
                    .and_then(Value::as_str)?;
                Some(Self {
                    filename: filename.to_string(),
                    size: obj.get("size").and_then(Value::as_u64),
                })
            }
            _ => None,
        }
    }
}

/// A reassembled JPEG, kept as a displayable data URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImagePayload {
    pub filename: String,

    /// Size announced by `image_start`
    pub size: Option<u64>,

    /// `data:image/jpeg;base64,<data>`
    pub data_url: String,
}

impl ImagePayload {
    /// Wrap an already-concatenated base64 string
    pub fn from_base64(filename: String, size: Option<u64>, base64: &str) -> Self {
        Self {
            filename,
            size,
            data_url: format!("{}{}", JPEG_DATA_URL_PREFIX, base64),
        }
    }

    /// The base64 body of the data URL
    pub fn base64(&self) -> &str {
        self.data_url
            .strip_prefix(JPEG_DATA_URL_PREFIX)
            .unwrap_or(&self.data_url)
    }

    /// Decode the JPEG bytes
    pub fn decode(&self) -> Result<Vec<u8>, LinkError> {
        use base64::Engine as _;

        base64::engine::general_purpose::STANDARD
            .decode(self.base64().trim())
            .map_err(|e| LinkError::ProtocolError(format!("Invalid image data for {}: {}", self.filename, e)))
    }
}

/// Device status fields as reported by `status` frames
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceStatus {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DeviceStatus {
    pub fn firmware_version(&self) -> Option<&str> {
        self.fields
            .get("firmware_version")
            .or_else(|| self.fields.get("version"))
            .and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// A complete logical response, delivered once per reassembled transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceResponse {
    Pong,
    Logs { logs: LogPayload },
    ImageList { images: Vec<ImageEntry> },
    Image(ImagePayload),
    ImageMetadata { filename: String, metadata: Value },
    Settings { settings: Map<String, Value> },
    SettingUpdated { setting: String, value: Value },
    Status(DeviceStatus),
    Error { message: String },
    Other { kind: String, body: Map<String, Value> },
}

impl DeviceResponse {
    /// Wire name of the response kind
    pub fn kind(&self) -> &str {
        match self {
            DeviceResponse::Pong => "pong",
            DeviceResponse::Logs { .. } => "logs",
            DeviceResponse::ImageList { .. } => "image_list",
            DeviceResponse::Image(_) => "image",
            DeviceResponse::ImageMetadata { .. } => "metadata_result",
            DeviceResponse::Settings { .. } => "settings",
            DeviceResponse::SettingUpdated { .. } => "setting_updated",
            DeviceResponse::Status(_) => "status",
            DeviceResponse::Error { .. } => "error",
            DeviceResponse::Other { kind, .. } => kind,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, DeviceResponse::Error { .. })
    }
}
