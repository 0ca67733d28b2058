//! Platform-independent GATT session seam

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::LinkError;
use crate::models::Device;

/// GATT write procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Acknowledged write request
    WithResponse,

    /// Fire-and-forget write command
    WithoutResponse,
}

/// Event raised by an open GATT session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// Value notified on a subscribed characteristic
    Notification { characteristic: Uuid, value: Vec<u8> },

    /// The peripheral dropped the connection
    Disconnected,
}

/// An open GATT connection
#[async_trait]
pub trait GattLink: Send + Sync {
    async fn write(&self, characteristic: Uuid, data: &[u8], mode: WriteMode) -> Result<(), LinkError>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, LinkError>;

    /// Whether `characteristic` accepts write commands
    fn supports_write_without_response(&self, characteristic: Uuid) -> bool;

    /// Disconnect from the peripheral
    async fn close(&self) -> Result<(), LinkError>;
}

/// Link plus its event feed. The feed ends (or yields `Disconnected`)
/// when the peripheral goes away.
pub struct GattSession {
    pub link: Arc<dyn GattLink>,
    pub events: mpsc::Receiver<GattEvent>,
}

/// Opens GATT sessions to devices
#[async_trait]
pub trait GattConnector: Send + Sync {
    /// Locate the peripheral, connect, resolve the BootBoots service and
    /// characteristics, and subscribe to notifications
    async fn open(&self, device: &Device) -> Result<GattSession, LinkError>;
}
