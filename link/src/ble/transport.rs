use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::gatt::{COMMAND_CHAR_UUID, STATUS_CHAR_UUID};
use crate::ble::link::{GattConnector, GattEvent, GattLink, GattSession, WriteMode};
use crate::ble::platform::{BtleplugConnector, BtleplugOptions};
use crate::chunking::{plan_command, send_frames, ChunkOptions, OutboundPlan};
use crate::errors::LinkError;
use crate::models::{Device, DeviceCommand, DeviceStatus};
use crate::transport::{
    ConnectionEvent, ConnectionFsm, ConnectionState, DeviceTransport, Dispatcher, HandlerId, Handlers,
    ResponseHandler, StateHandler, STATUS_TIMEOUT,
};

/// Bluetooth transport options
#[derive(Debug, Clone)]
pub struct BluetoothOptions {
    /// Outbound framing
    pub chunking: ChunkOptions,

    /// Wait window of `query_status`
    pub status_timeout: Duration,

    /// Read the status characteristic once the link is up
    pub read_status_on_connect: bool,

    /// Request metadata for every completed image
    pub fetch_image_metadata: bool,
}

impl Default for BluetoothOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkOptions::default(),
            status_timeout: STATUS_TIMEOUT,
            read_status_on_connect: true,
            fetch_image_metadata: true,
        }
    }
}

#[derive(Default)]
struct Session {
    fsm: ConnectionFsm,
    device: Option<Device>,
    link: Option<Arc<dyn GattLink>>,
    pump: Option<JoinHandle<()>>,

    /// Bumped on every install and teardown so events from an older link
    /// are recognised and ignored
    generation: u64,
}

struct Shared {
    connector: Arc<dyn GattConnector>,
    options: BluetoothOptions,
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

    /// Apply `event` and notify state handlers if the state changed
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

    fn current_link(&self) -> Option<Arc<dyn GattLink>> {
        let session = self.session();
        if !session.fsm.state().is_connected() {
            return None;
        }
        session.link.clone()
    }

    /// Drop the link and every piece of per-connection state
    fn teardown(&self, event: ConnectionEvent) {
        let (link, changed) = {
            let mut session = self.session();
            session.generation += 1;
            session.device = None;
            if let Some(pump) = session.pump.take() {
                pump.abort();
            }
            let link = session.link.take();

            let before = session.fsm.state();
            let after = match session.fsm.process(event) {
                Ok(state) => state,
                Err(_) => session
                    .fsm
                    .process(ConnectionEvent::Disconnect)
                    .unwrap_or(ConnectionState::Disconnected),
            };
            (link, (before != after).then_some(after))
        };

        self.dispatcher.reset();
        if let Some(link) = link {
            close_link(link);
        }
        if let Some(state) = changed {
            self.state_handlers.emit(&state);
        }
    }

    async fn send(&self, command: &DeviceCommand) -> Result<(), LinkError> {
        let link = self.current_link().ok_or(LinkError::NotConnected)?;
        let plan = plan_command(command, &self.options.chunking)?;
        let mode = if link.supports_write_without_response(COMMAND_CHAR_UUID) {
            WriteMode::WithoutResponse
        } else {
            WriteMode::WithResponse
        };

        match plan {
            OutboundPlan::Single(bytes) => {
                debug!("Sending {} ({} bytes)", command.command.as_str(), bytes.len());
                link.write(COMMAND_CHAR_UUID, &bytes, mode).await
            }
            OutboundPlan::Chunked(frames) => {
                info!("Sending {} in {} chunks", command.command.as_str(), frames.len());
                send_frames(frames, self.options.chunking.inter_chunk_delay, |frame| {
                    let link = link.clone();
                    async move { link.write(COMMAND_CHAR_UUID, &frame, mode).await }
                })
                .await
            }
        }
    }

    /// Best-effort read of the status characteristic
    async fn read_initial_status(&self, link: &Arc<dyn GattLink>) {
        match link.read(STATUS_CHAR_UUID).await {
            Ok(bytes) => match status_frame(&bytes) {
                Some(frame) => {
                    self.dispatcher.handle_value(frame);
                }
                None => debug!("Ignoring unreadable status value ({} bytes)", bytes.len()),
            },
            Err(e) => debug!("Initial status read failed: {}", e),
        }
    }
}

/// Close a detached link without blocking the caller
fn close_link(link: Arc<dyn GattLink>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = link.close().await {
                    debug!("Failed to close GATT link: {}", e);
                }
            });
        }
        Err(_) => debug!("No runtime available to close GATT link"),
    }
}

/// Status characteristic values carry no frame type
fn status_frame(bytes: &[u8]) -> Option<Value> {
    match serde_json::from_slice::<Value>(bytes).ok()? {
        Value::Object(mut fields) => {
            fields
                .entry("type")
                .or_insert_with(|| Value::String("status".to_string()));
            Some(Value::Object(fields))
        }
        _ => None,
    }
}

/// Feed one session's events into the dispatcher until the link drops
async fn pump(shared: Weak<Shared>, generation: u64, mut events: mpsc::Receiver<GattEvent>) {
    while let Some(event) = events.recv().await {
        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        if !shared.is_current(generation) {
            return;
        }

        let (characteristic, value) = match event {
            GattEvent::Notification { characteristic, value } => (characteristic, value),
            GattEvent::Disconnected => break,
        };

        let follow_ups = if characteristic == STATUS_CHAR_UUID {
            match status_frame(&value) {
                Some(frame) => shared.dispatcher.handle_value(frame),
                None => shared.dispatcher.handle_frame(&value),
            }
        } else {
            shared.dispatcher.handle_frame(&value)
        };

        for command in follow_ups {
            if let Err(e) = shared.send(&command).await {
                warn!("Failed to send {}: {}", command.command.as_str(), e);
            }
        }
    }

    if let Some(shared) = shared.upgrade() {
        if shared.is_current(generation) {
            warn!("Bluetooth link lost");
            shared.teardown(ConnectionEvent::Closed);
        }
    }
}

/// [`DeviceTransport`] over a BootBoots GATT service
pub struct BluetoothTransport {
    shared: Arc<Shared>,
}

impl BluetoothTransport {
    pub fn new(connector: Arc<dyn GattConnector>, options: BluetoothOptions) -> Self {
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

    /// Transport on the host Bluetooth adapter
    pub fn with_btleplug(adapter: BtleplugOptions, options: BluetoothOptions) -> Self {
        Self::new(Arc::new(BtleplugConnector::new(adapter)), options)
    }

    /// Reason the last connection attempt failed
    pub fn last_error(&self) -> Option<String> {
        self.shared.session().fsm.last_error().map(str::to_string)
    }

    /// Whether no inbound transfer is in progress
    pub fn is_idle(&self) -> bool {
        self.shared.dispatcher.is_idle()
    }
}

#[async_trait]
impl DeviceTransport for BluetoothTransport {
    async fn connect(&self, device: &Device) -> Result<(), LinkError> {
        let shared = &self.shared;
        let _guard = shared.connect_lock.lock().await;

        let switching = {
            let session = shared.session();
            match &session.device {
                Some(current) if current.id == device.id && session.fsm.state().is_connected() => {
                    debug!("Already connected to {}", device.name);
                    return Ok(());
                }
                Some(current) => Some(current.name.clone()),
                None => None,
            }
        };
        if let Some(previous) = switching {
            info!("Switching from {} to {}", previous, device.name);
            shared.teardown(ConnectionEvent::Disconnect);
        }

        shared.transition(ConnectionEvent::Connect)?;
        let epoch = shared.session().generation;

        let GattSession { link, events } = match shared.connector.open(device).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to connect to {}: {}", device.name, e);
                if shared.is_current(epoch) {
                    shared.transition(ConnectionEvent::Failed(e.to_string()))?;
                }
                return Err(e);
            }
        };

        let generation = {
            let mut session = shared.session();
            if session.generation != epoch {
                drop(session);
                close_link(link);
                return Err(LinkError::ConnectionError(format!(
                    "Connection to {} was cancelled",
                    device.name
                )));
            }
            session.fsm.process(ConnectionEvent::Opened).map_err(LinkError::Internal)?;
            session.generation += 1;
            session.link = Some(link.clone());
            session.device = Some(device.clone());
            session.generation
        };

        let task = tokio::spawn(pump(Arc::downgrade(shared), generation, events));
        {
            let mut session = shared.session();
            if session.generation == generation {
                session.pump = Some(task);
            } else {
                task.abort();
            }
        }

        info!("Connected to {} over Bluetooth", device.name);
        shared.state_handlers.emit(&ConnectionState::Connected);

        if shared.options.read_status_on_connect {
            shared.read_initial_status(&link).await;
        }
        Ok(())
    }

    fn disconnect(&self) {
        debug!("Disconnecting Bluetooth transport");
        self.shared.teardown(ConnectionEvent::Disconnect);
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
        "bluetooth"
    }
}
