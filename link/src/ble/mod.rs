//! Bluetooth LE transport

pub mod gatt;
pub mod link;
pub mod platform;
pub mod transport;

pub use gatt::{BOOTBOOTS_SERVICE_UUID, COMMAND_CHAR_UUID, LOGS_CHAR_UUID, STATUS_CHAR_UUID};
pub use link::{GattConnector, GattEvent, GattLink, GattSession, WriteMode};
pub use platform::{BtleplugConnector, BtleplugOptions};
pub use transport::{BluetoothOptions, BluetoothTransport};
