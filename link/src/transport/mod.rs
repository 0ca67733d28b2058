//! Transport-agnostic device capability contract

pub mod dispatch;
pub mod handlers;
pub mod state;

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::LinkError;
use crate::models::{Device, DeviceCommand, DeviceResponse, DeviceStatus};

pub use dispatch::{Dispatcher, STATUS_TIMEOUT};
pub use handlers::{Handler, HandlerId, Handlers};
pub use state::{ConnectionEvent, ConnectionFsm, ConnectionState};

/// Callback for reassembled responses
pub type ResponseHandler = Handler<DeviceResponse>;

/// Callback for connection state transitions
pub type StateHandler = Handler<ConnectionState>;

/// Uniform surface every device transport exposes.
///
/// One instance owns one underlying channel and at most one connected
/// device. Responses are delivered through the registered handlers, never
/// as the result of `send_command`.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Connect to `device`.
    ///
    /// A no-op when already connected to the same device; switching devices
    /// disconnects first. On failure the state returns to `Disconnected`.
    async fn connect(&self, device: &Device) -> Result<(), LinkError>;

    /// Close the channel without waiting and clear all transfer state
    fn disconnect(&self);

    /// Serialize and transmit a command
    async fn send_command(&self, command: &DeviceCommand) -> Result<(), LinkError>;

    /// Send `get_status` and wait for the reply
    async fn query_status(&self) -> Result<DeviceStatus, LinkError>;

    fn on_response(&self, handler: ResponseHandler) -> HandlerId;

    fn off_response(&self, id: HandlerId) -> bool;

    fn on_connection_state_change(&self, handler: StateHandler) -> HandlerId;

    fn off_connection_state_change(&self, id: HandlerId) -> bool;

    fn connection_state(&self) -> ConnectionState;

    /// The device this instance is bound to, if any
    fn connected_device(&self) -> Option<Device>;

    /// Short transport name for logs
    fn transport_type(&self) -> &'static str;
}

/// Wrap a closure as a [`ResponseHandler`]
pub fn response_handler<F>(f: F) -> ResponseHandler
where
    F: Fn(&DeviceResponse) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`StateHandler`]
pub fn state_handler<F>(f: F) -> StateHandler
where
    F: Fn(&ConnectionState) + Send + Sync + 'static,
{
    Arc::new(f)
}
