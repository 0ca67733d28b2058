//! bootlink library
//!
//! Command/response transport for BootBoots devices: a shared capability
//! contract, chunk reassembly, and Bluetooth LE and WebSocket relay
//! bindings.

pub mod app;
pub mod authn;
pub mod ble;
pub mod cache;
pub mod chunking;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod storage;
pub mod transport;
pub mod utils;
pub mod ws;
