//! Command/response vocabulary shared by every transport

pub mod command;
pub mod device;
pub mod response;

pub use command::{CommandKind, DeviceCommand};
pub use device::{Capability, Device, DeviceType};
pub use response::{DeviceResponse, DeviceStatus, ImageEntry, ImagePayload, LogPayload};
