//! Fake GATT and relay endpoints shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

use bootlink::ble::gatt::{COMMAND_CHAR_UUID, STATUS_CHAR_UUID};
use bootlink::ble::{GattConnector, GattEvent, GattLink, GattSession, WriteMode};
use bootlink::errors::LinkError;
use bootlink::models::{Device, DeviceResponse, DeviceType};
use bootlink::transport::{response_handler, state_handler, ConnectionState, DeviceTransport};
use bootlink::ws::{WsChannel, WsConnector};

/// Poll `condition` until it holds, failing the test after 5s
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    eventually_within(Duration::from_secs(5), condition).await
}

/// Poll `condition` until it holds or `limit` elapses. Under a paused clock
/// the limit is virtual time.
pub async fn eventually_within<F: Fn() -> bool>(limit: Duration, condition: F) {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(condition(), "condition not met within {:?}", limit);
}

pub fn camera(id: &str) -> Device {
    Device::new(id, id, DeviceType::Bootboots)
}

/// Responses and state changes observed on a transport
#[derive(Clone, Default)]
pub struct Recorder {
    pub responses: Arc<Mutex<Vec<DeviceResponse>>>,
    pub states: Arc<Mutex<Vec<(ConnectionState, Instant)>>>,
}

impl Recorder {
    pub fn attach(transport: &dyn DeviceTransport) -> Self {
        let recorder = Recorder::default();
        let responses = recorder.responses.clone();
        transport.on_response(response_handler(move |r| responses.lock().unwrap().push(r.clone())));
        let states = recorder.states.clone();
        transport.on_connection_state_change(state_handler(move |s| states.lock().unwrap().push((*s, Instant::now()))));
        recorder
    }

    pub fn responses(&self) -> Vec<DeviceResponse> {
        self.responses.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.states.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    pub fn count(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

// =============================== GATT ================================== //

/// Device-side behaviour: frames notified on the command characteristic in
/// reply to a decoded command
pub type Responder = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Write {
    pub characteristic: Uuid,
    pub data: Vec<u8>,
    pub mode: WriteMode,
    pub at: Instant,
}

impl Write {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.data).unwrap()
    }
}

pub struct FakeLink {
    pub writes: Mutex<Vec<Write>>,
    pub closed: AtomicBool,
    status: Option<Vec<u8>>,
    without_response: bool,
    responder: Responder,
    events: mpsc::Sender<GattEvent>,
}

impl FakeLink {
    /// Notify a raw frame on the command characteristic
    pub fn notify(&self, frame: &str) {
        let _ = self.events.try_send(GattEvent::Notification {
            characteristic: COMMAND_CHAR_UUID,
            value: frame.as_bytes().to_vec(),
        });
    }

    /// Simulate the peripheral going away
    pub fn drop_connection(&self) {
        let _ = self.events.try_send(GattEvent::Disconnected);
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.lock().unwrap().clone()
    }

    /// Commands written as single frames
    pub fn commands(&self) -> Vec<String> {
        self.writes()
            .iter()
            .filter_map(|w| serde_json::from_slice::<Value>(&w.data).ok())
            .filter_map(|v| v.get("command").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl GattLink for FakeLink {
    async fn write(&self, characteristic: Uuid, data: &[u8], mode: WriteMode) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::BluetoothError("link closed".to_string()));
        }
        self.writes.lock().unwrap().push(Write {
            characteristic,
            data: data.to_vec(),
            mode,
            at: Instant::now(),
        });
        if let Ok(command) = serde_json::from_slice::<Value>(data) {
            for frame in (self.responder)(&command) {
                self.notify(&frame);
            }
        }
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, LinkError> {
        match (&self.status, characteristic == STATUS_CHAR_UUID) {
            (Some(status), true) => Ok(status.clone()),
            _ => Err(LinkError::NotFound(format!("Characteristic {}", characteristic))),
        }
    }

    fn supports_write_without_response(&self, _characteristic: Uuid) -> bool {
        self.without_response
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeGatt {
    pub opens: AtomicUsize,
    pub fail: AtomicBool,
    pub status: Mutex<Option<Vec<u8>>>,
    pub without_response: AtomicBool,
    pub links: Mutex<Vec<Arc<FakeLink>>>,
    responder: Responder,
}

impl FakeGatt {
    pub fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            opens: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            status: Mutex::new(None),
            without_response: AtomicBool::new(true),
            links: Mutex::new(Vec::new()),
            responder,
        })
    }

    /// Fake answering nothing
    pub fn silent() -> Arc<Self> {
        Self::new(Arc::new(|_: &Value| Vec::new()))
    }

    pub fn link(&self) -> Arc<FakeLink> {
        self.links.lock().unwrap().last().cloned().expect("no link opened")
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GattConnector for FakeGatt {
    async fn open(&self, device: &Device) -> Result<GattSession, LinkError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(LinkError::NotFound(format!("Bluetooth device {}", device.name)));
        }

        let (tx, rx) = mpsc::channel(256);
        let link = Arc::new(FakeLink {
            writes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            status: self.status.lock().unwrap().clone(),
            without_response: self.without_response.load(Ordering::SeqCst),
            responder: self.responder.clone(),
            events: tx,
        });
        self.links.lock().unwrap().push(link.clone());
        Ok(GattSession { link, events: rx })
    }
}

// =============================== RELAY ================================== //

/// Server side of one fake relay connection
pub struct RelayEnd {
    pub outbound: fmpsc::UnboundedReceiver<Message>,
    pub inbound: fmpsc::UnboundedSender<Result<Message, LinkError>>,
}

impl RelayEnd {
    /// Next message the client sent, as JSON
    pub async fn next_json(&mut self) -> Value {
        let message = tokio::time::timeout(Duration::from_secs(5), self.outbound.next())
            .await
            .expect("timed out waiting for client message")
            .expect("client channel closed");
        match message {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected message {:?}", other),
        }
    }

    pub fn push(&self, text: &str) {
        self.inbound
            .unbounded_send(Ok(Message::Text(text.to_string().into())))
            .unwrap();
    }

    /// Wrap `response` in a relay envelope for `device_id`
    pub fn respond(&self, device_id: &str, response: &str) {
        self.push(&format!(
            r#"{{"type":"deviceResponse","deviceId":"{}","response":{}}}"#,
            device_id, response
        ));
    }
}

pub struct FakeRelay {
    pub opens: Mutex<Vec<Instant>>,
    /// Number of upcoming opens that fail
    pub failures: Mutex<VecDeque<bool>>,
    pub fail_always: AtomicBool,
    pub ends: Mutex<Vec<RelayEnd>>,
}

impl FakeRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            opens: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            fail_always: AtomicBool::new(false),
            ends: Mutex::new(Vec::new()),
        })
    }

    pub fn opens(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }

    /// Take the most recent connection's server end
    pub fn take_end(&self) -> RelayEnd {
        self.ends.lock().unwrap().pop().expect("no relay connection")
    }

    pub fn fail_next(&self, count: usize) {
        let mut failures = self.failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(true);
        }
    }
}

#[async_trait]
impl WsConnector for FakeRelay {
    async fn open(&self) -> Result<WsChannel, LinkError> {
        self.opens.lock().unwrap().push(Instant::now());
        let fail = self.fail_always.load(Ordering::SeqCst)
            || self.failures.lock().unwrap().pop_front().unwrap_or(false);
        if fail {
            return Err(LinkError::ConnectionError("Relay handshake failed: refused".to_string()));
        }

        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, LinkError>>();
        self.ends.lock().unwrap().push(RelayEnd {
            outbound: out_rx,
            inbound: in_tx,
        });

        Ok(WsChannel {
            sink: Box::pin(out_tx.sink_map_err(|e| LinkError::ConnectionError(e.to_string()))),
            stream: Box::pin(in_rx),
        })
    }
}
