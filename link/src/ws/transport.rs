use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::authn::Credentials;
use crate::errors::LinkError;
use crate::models::{Device, DeviceCommand, DeviceStatus};
use crate::transport::{
    ConnectionEvent, ConnectionFsm, ConnectionState, DeviceTransport, Dispatcher, HandlerId, Handlers,
    ResponseHandler, StateHandler, STATUS_TIMEOUT,
};
use crate::utils::{calc_exp_backoff, CooldownOptions};
use crate::ws::connector::{TungsteniteConnector, WsChannel, WsConnector, WsSink, WsStream};
use crate::ws::envelope::{ping_text, CommandEnvelope, ResponseEnvelope};

/// WebSocket transport options
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    /// Delay before the first reconnection attempt, doubled per attempt
    pub reconnect_base_delay: Duration,

    /// Reconnection attempts after an unexpected close
    pub max_reconnect_attempts: u32,

    /// Relay keep-alive interval, `None` to disable
    pub heartbeat_interval: Option<Duration>,

    /// Wait window of `query_status`
    pub status_timeout: Duration,

    /// Request metadata for every completed image
    pub fetch_image_metadata: bool,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            heartbeat_interval: None,
            status_timeout: STATUS_TIMEOUT,
            fetch_image_metadata: true,
        }
    }
}

#[derive(Default)]
struct Session {
    fsm: ConnectionFsm,

    /// Bound device, kept while reconnecting
    device: Option<Device>,

    sink: Option<Arc<tokio::sync::Mutex<WsSink>>>,

    /// Reader and heartbeat of the open channel
    tasks: Vec<JoinHandle<()>>,

    reconnect: Option<JoinHandle<()>>,

    /// Reconnection attempts made since the last successful open
    attempts: u32,

    generation: u64,
}

struct Shared {
    connector: Arc<dyn WsConnector>,
    options: WebSocketOptions,
    connect_lock: tokio::sync::Mutex<()>,
    session: Mutex<Session>,
    dispatcher: Dispatcher,
    state_handlers: Handlers<ConnectionState>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session().generation == generation
    }

    fn transition(&self, event: ConnectionEvent) -> Result<ConnectionState, LinkError> {
        let (before, after) = {
            let mut session = self.session();
            let before = session.fsm.state();
            let after = session.fsm.process(event).map_err(LinkError::Internal)?;
            (before, after)
        };
        if before != after {
            self.state_handlers.emit(&after);
        }
        Ok(after)
    }

    /// Open the relay channel for `device`.
    ///
    /// Explicit connects pass `ConnectionEvent::Connect`; reconnection
    /// attempts pass nothing and stay in `Reconnecting` on failure.
    async fn open(self: &Arc<Self>, device: &Device, initial: Option<ConnectionEvent>) -> Result<(), LinkError> {
        if let Some(event) = initial {
            self.transition(event)?;
        }
        let epoch = self.session().generation;

        let WsChannel { sink, stream } = match self.connector.open().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to open relay channel for {}: {}", device.name, e);
                if self.is_current(epoch) {
                    self.transition(ConnectionEvent::Failed(e.to_string()))?;
                }
                return Err(e);
            }
        };

        let generation = {
            let mut session = self.session();
            if session.generation != epoch {
                return Err(LinkError::ConnectionError(format!(
                    "Connection to {} was cancelled",
                    device.name
                )));
            }
            session.fsm.process(ConnectionEvent::Opened).map_err(LinkError::Internal)?;
            session.generation += 1;
            session.sink = Some(Arc::new(tokio::sync::Mutex::new(sink)));
            session.device = Some(device.clone());
            session.attempts = 0;
            session.generation
        };

        let mut tasks = vec![tokio::spawn(reader(Arc::downgrade(self), generation, stream))];
        if let Some(interval) = self.options.heartbeat_interval {
            tasks.push(tokio::spawn(heartbeat(Arc::downgrade(self), generation, interval)));
        }
        {
            let mut session = self.session();
            if session.generation == generation {
                session.tasks = tasks;
            } else {
                tasks.iter().for_each(JoinHandle::abort);
            }
        }

        info!("Connected to {} through relay", device.name);
        self.state_handlers.emit(&ConnectionState::Connected);
        Ok(())
    }

    /// Stop the channel, reconnection and all transfer state
    fn teardown(&self) {
        let (sink, changed) = {
            let mut session = self.session();
            session.generation += 1;
            session.device = None;
            session.attempts = 0;
            for task in session.tasks.drain(..) {
                task.abort();
            }
            if let Some(task) = session.reconnect.take() {
                task.abort();
            }
            let sink = session.sink.take();

            let before = session.fsm.state();
            let after = session
                .fsm
                .process(ConnectionEvent::Disconnect)
                .unwrap_or(ConnectionState::Disconnected);
            (sink, (before != after).then_some(after))
        };

        self.dispatcher.reset();
        if let Some(sink) = sink {
            close_sink(sink);
        }
        if let Some(state) = changed {
            self.state_handlers.emit(&state);
        }
    }

    /// The channel dropped on its own
    fn on_closed(self: &Arc<Self>) {
        let (device, epoch) = {
            let mut session = self.session();
            if !session.fsm.state().is_connected() {
                return;
            }
            session.generation += 1;
            session.sink = None;
            for task in session.tasks.drain(..) {
                task.abort();
            }
            if let Err(e) = session.fsm.process(ConnectionEvent::Closed) {
                debug!("{}", e);
            }
            if self.options.max_reconnect_attempts == 0 {
                session.device = None;
            }
            (session.device.clone(), session.generation)
        };

        self.dispatcher.reset();
        self.state_handlers.emit(&ConnectionState::Disconnected);

        if let Some(device) = device {
            let task = tokio::spawn(reconnect(Arc::downgrade(self), device, epoch));
            let mut session = self.session();
            if session.generation == epoch {
                session.reconnect = Some(task);
            } else {
                task.abort();
            }
        }
    }

    async fn send_text(&self, text: String) -> Result<(), LinkError> {
        let sink = {
            let session = self.session();
            if !session.fsm.state().is_connected() {
                return Err(LinkError::NotConnected);
            }
            session.sink.clone().ok_or(LinkError::NotConnected)?
        };
        let mut sink = sink.lock().await;
        sink.send(Message::Text(text.into())).await
    }

    async fn send(&self, command: &DeviceCommand) -> Result<(), LinkError> {
        let device_id = {
            let session = self.session();
            match (&session.device, session.fsm.state().is_connected()) {
                (Some(device), true) => device.id.clone(),
                _ => return Err(LinkError::NotConnected),
            }
        };
        let text = CommandEnvelope::new(&device_id, command).to_text()?;
        debug!("Sending {} to {} ({} bytes)", command.command.as_str(), device_id, text.len());
        self.send_text(text).await
    }

    async fn handle_text(&self, text: &str) {
        let envelope = match ResponseEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping relay message: {}", e);
                return;
            }
        };

        let device_id = match self.session().device.as_ref() {
            Some(device) => device.id.clone(),
            None => return,
        };
        let kind = envelope.kind.clone();
        let response = match envelope.into_response_for(&device_id) {
            Some(response) => response,
            None => {
                debug!("Ignoring relay message {}", kind);
                return;
            }
        };

        for command in self.dispatcher.handle_value(response) {
            if let Err(e) = self.send(&command).await {
                warn!("Failed to send {}: {}", command.command.as_str(), e);
            }
        }
    }
}

fn close_sink(sink: Arc<tokio::sync::Mutex<WsSink>>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let mut sink = sink.lock().await;
                if let Err(e) = sink.close().await {
                    debug!("Failed to close relay channel: {}", e);
                }
            });
        }
        Err(_) => debug!("No runtime available to close relay channel"),
    }
}

async fn reader(shared: Weak<Shared>, generation: u64, mut stream: WsStream) {
    while let Some(message) = stream.next().await {
        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        if !shared.is_current(generation) {
            return;
        }

        match message {
            Ok(Message::Text(text)) => shared.handle_text(text.as_str()).await,
            Ok(Message::Close(frame)) => {
                info!("Relay closed connection: {:?}", frame);
                break;
            }
            Ok(Message::Binary(data)) => debug!("Ignoring binary relay message ({} bytes)", data.len()),
            Ok(_) => {}
            Err(e) => {
                warn!("Relay WebSocket error: {}", e);
                break;
            }
        }
    }

    if let Some(shared) = shared.upgrade() {
        if shared.is_current(generation) {
            shared.on_closed();
        }
    }
}

async fn heartbeat(shared: Weak<Shared>, generation: u64, interval: Duration) {
    let start = tokio::time::Instant::now() + interval;
    let mut tick = tokio::time::interval_at(start, interval);
    loop {
        tick.tick().await;
        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        if !shared.is_current(generation) {
            return;
        }
        if let Err(e) = shared.send_text(ping_text()).await {
            warn!("Failed to send heartbeat: {}", e);
            return;
        }
    }
}

/// Reopen the channel with exponential backoff until it succeeds or the
/// attempts run out. Stops as soon as the session moves past `epoch`.
async fn reconnect(shared: Weak<Shared>, device: Device, epoch: u64) {
    let (max_attempts, cooldown) = match shared.upgrade() {
        Some(shared) => (
            shared.options.max_reconnect_attempts,
            CooldownOptions::with_base_delay(shared.options.reconnect_base_delay),
        ),
        None => return,
    };

    for attempt in 1..=max_attempts {
        let delay = calc_exp_backoff(&cooldown, attempt - 1);
        {
            let shared = match shared.upgrade() {
                Some(shared) => shared,
                None => return,
            };
            if !shared.is_current(epoch) {
                return;
            }
            shared.session().attempts = attempt;
            if let Err(e) = shared.transition(ConnectionEvent::Retry) {
                warn!("Cannot retry: {}", e);
                return;
            }
        }

        info!("Reconnecting to {} in {:?} (attempt {}/{})", device.name, delay, attempt, max_attempts);
        tokio::time::sleep(delay).await;

        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        let _guard = shared.connect_lock.lock().await;
        if !shared.is_current(epoch) {
            return;
        }
        match shared.open(&device, None).await {
            Ok(()) => return,
            Err(e) => warn!("Reconnection attempt {} failed: {}", attempt, e),
        }
    }

    if let Some(shared) = shared.upgrade() {
        {
            let mut session = shared.session();
            if session.generation != epoch {
                return;
            }
            session.device = None;
            session.reconnect = None;
        }
        warn!("Giving up on {} after {} attempts", device.name, max_attempts);
        if let Err(e) = shared.transition(ConnectionEvent::RetriesExhausted) {
            debug!("{}", e);
        }
    }
}

/// [`DeviceTransport`] over the WebSocket relay
pub struct WebSocketTransport {
    shared: Arc<Shared>,
}

impl WebSocketTransport {
    pub fn new(connector: Arc<dyn WsConnector>, options: WebSocketOptions) -> Self {
        let dispatcher = Dispatcher::new(options.fetch_image_metadata);
        Self {
            shared: Arc::new(Shared {
                connector,
                options,
                connect_lock: tokio::sync::Mutex::new(()),
                session: Mutex::new(Session::default()),
                dispatcher,
                state_handlers: Handlers::new(),
            }),
        }
    }

    /// Transport talking to the relay at `endpoint`
    pub fn relay(endpoint: &str, credentials: Option<Credentials>, options: WebSocketOptions) -> Result<Self, LinkError> {
        let connector = TungsteniteConnector::new(endpoint, credentials)?;
        Ok(Self::new(Arc::new(connector), options))
    }

    /// Reconnection attempts made since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.session().attempts
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.session().fsm.last_error().map(str::to_string)
    }
}

#[async_trait]
impl DeviceTransport for WebSocketTransport {
    async fn connect(&self, device: &Device) -> Result<(), LinkError> {
        let shared = &self.shared;
        let _guard = shared.connect_lock.lock().await;

        let switching = {
            let mut session = shared.session();
            if let Some(task) = session.reconnect.take() {
                task.abort();
            }
            session.attempts = 0;
            match &session.device {
                Some(current) if current.id == device.id && session.fsm.state().is_connected() => {
                    debug!("Already connected to {}", device.name);
                    return Ok(());
                }
                Some(current) if current.id != device.id => Some(current.name.clone()),
                _ => None,
            }
        };
        if let Some(previous) = switching {
            info!("Switching from {} to {}", previous, device.name);
            shared.teardown();
        }

        shared.open(device, Some(ConnectionEvent::Connect)).await
    }

    fn disconnect(&self) {
        debug!("Disconnecting relay transport");
        self.shared.teardown();
    }

    async fn send_command(&self, command: &DeviceCommand) -> Result<(), LinkError> {
        self.shared.send(command).await
    }

    async fn query_status(&self) -> Result<DeviceStatus, LinkError> {
        let command = DeviceCommand::get_status();
        self.shared
            .dispatcher
            .query_status(self.shared.options.status_timeout, self.shared.send(&command))
            .await
    }

    fn on_response(&self, handler: ResponseHandler) -> HandlerId {
        self.shared.dispatcher.responses().add(handler)
    }

    fn off_response(&self, id: HandlerId) -> bool {
        self.shared.dispatcher.responses().remove(id)
    }

    fn on_connection_state_change(&self, handler: StateHandler) -> HandlerId {
        self.shared.state_handlers.add(handler)
    }

    fn off_connection_state_change(&self, id: HandlerId) -> bool {
        self.shared.state_handlers.remove(id)
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.session().fsm.state()
    }

    fn connected_device(&self) -> Option<Device> {
        self.shared.session().device.clone()
    }

    fn transport_type(&self) -> &'static str {
        "websocket"
    }
}
