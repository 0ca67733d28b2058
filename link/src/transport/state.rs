//! Connection lifecycle state machine

use serde::{Deserialize, Serialize};

/// Connection state of a transport instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }
}

/// Lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Explicit connect requested
    Connect,

    /// Underlying channel is open
    Opened,

    /// Opening the channel failed
    Failed(String),

    /// Channel dropped on its own
    Closed,

    /// Explicit disconnect
    Disconnect,

    /// Automatic reconnection attempt scheduled
    Retry,

    /// No reconnection attempts left
    RetriesExhausted,
}

/// Connection FSM.
///
/// `Connecting` and `Reconnecting` always leave through `Connected` or
/// `Disconnected`.
#[derive(Debug, Clone, Default)]
pub struct ConnectionFsm {
    state: ConnectionState,
    last_error: Option<String>,
}

impl ConnectionFsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reason of the last failed open
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Apply an event. Returns the new state, or an error for a transition
    /// the lifecycle does not allow.
    pub fn process(&mut self, event: ConnectionEvent) -> Result<ConnectionState, String> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let new_state = match (self.state, &event) {
            (_, E::Disconnect) => S::Disconnected,

            (S::Disconnected, E::Connect) | (S::Reconnecting, E::Connect) => {
                self.last_error = None;
                S::Connecting
            }

            (S::Connecting, E::Opened) | (S::Reconnecting, E::Opened) => {
                self.last_error = None;
                S::Connected
            }
            (S::Connecting, E::Failed(err)) => {
                self.last_error = Some(err.clone());
                S::Disconnected
            }
            (S::Reconnecting, E::Failed(err)) => {
                self.last_error = Some(err.clone());
                S::Reconnecting
            }

            (S::Connected, E::Closed) => S::Disconnected,

            (S::Disconnected, E::Retry) | (S::Reconnecting, E::Retry) => S::Reconnecting,
            (S::Reconnecting, E::RetriesExhausted) => S::Disconnected,

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}
