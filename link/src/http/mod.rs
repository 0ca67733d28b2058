//! Cloud API access

pub mod client;
pub mod devices;

pub use client::ApiClient;
pub use devices::{DeviceListResponse, DeviceRecord, DEFAULT_PROJECT};
