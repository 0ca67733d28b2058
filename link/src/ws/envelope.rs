//! Relay message envelopes

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::LinkError;
use crate::models::DeviceCommand;

/// Envelope type carrying a device response
pub const DEVICE_RESPONSE: &str = "deviceResponse";

/// Outbound relay message
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope<'a> {
    pub action: &'static str,
    pub device_id: &'a str,
    pub command: &'a DeviceCommand,
}

impl<'a> CommandEnvelope<'a> {
    pub fn new(device_id: &'a str, command: &'a DeviceCommand) -> Self {
        Self {
            action: "sendCommand",
            device_id,
            command,
        }
    }

    pub fn to_text(&self) -> Result<String, LinkError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Heartbeat frame understood by the relay
pub fn ping_text() -> String {
    serde_json::json!({ "action": "ping" }).to_string()
}

/// Inbound relay message
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default)]
    pub response: Option<Value>,
}

impl ResponseEnvelope {
    pub fn parse(text: &str) -> Result<Self, LinkError> {
        serde_json::from_str(text).map_err(|e| LinkError::ProtocolError(format!("Invalid relay message: {}", e)))
    }

    /// The inner device response if this envelope targets `device_id`
    pub fn into_response_for(self, device_id: &str) -> Option<Value> {
        if self.kind != DEVICE_RESPONSE {
            return None;
        }
        match self.device_id.as_deref() {
            Some(id) if id == device_id => self.response,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_envelope() {
        let cmd = DeviceCommand::take_photo();
        let text = CommandEnvelope::new("BootBoots-CatCam", &cmd).to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["action"], "sendCommand");
        assert_eq!(value["deviceId"], "BootBoots-CatCam");
        assert_eq!(value["command"]["command"], "take_photo");
    }

    #[test]
    fn test_response_for_device() {
        let env = ResponseEnvelope::parse(
            r#"{"type":"deviceResponse","deviceId":"cam-1","response":{"type":"pong"}}"#,
        )
        .unwrap();
        assert_eq!(env.clone().into_response_for("cam-2"), None);
        assert_eq!(env.into_response_for("cam-1").unwrap()["type"], "pong");
    }

    #[test]
    fn test_other_envelope_types_ignored() {
        let env = ResponseEnvelope::parse(r#"{"type":"connected","deviceId":"cam-1"}"#).unwrap();
        assert!(env.into_response_for("cam-1").is_none());
    }

    #[test]
    fn test_invalid_envelope() {
        assert!(matches!(ResponseEnvelope::parse("[]"), Err(LinkError::ProtocolError(_))));
    }
}
