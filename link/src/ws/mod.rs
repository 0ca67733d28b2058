//! WebSocket relay transport

pub mod connector;
pub mod envelope;
pub mod transport;

pub use connector::{relay_url, TungsteniteConnector, WsChannel, WsConnector, WsSink, WsStream};
pub use envelope::{CommandEnvelope, ResponseEnvelope};
pub use transport::{WebSocketOptions, WebSocketTransport};
