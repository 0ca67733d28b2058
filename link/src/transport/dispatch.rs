//! Inbound frame dispatch shared by every transport.
//!
//! Each physical frame is classified and either completes a pending status
//! wait, feeds the reassembler, or is delivered straight to the response
//! handlers. Malformed frames are logged and dropped here and never reach
//! the caller.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::chunking::reassembler::{log_lines, Reassembler};
use crate::errors::LinkError;
use crate::models::response::{parse_frame, parse_value, Frame, Inbound};
use crate::models::{DeviceCommand, DeviceResponse, DeviceStatus};
use crate::transport::handlers::Handlers;

/// Wait window for a one-shot status query
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

type StatusWaiter = oneshot::Sender<Result<DeviceStatus, LinkError>>;

/// Frame dispatcher for one transport instance
#[derive(Debug)]
pub struct Dispatcher {
    reassembler: Mutex<Reassembler>,
    status_waiters: Mutex<Vec<StatusWaiter>>,
    responses: Handlers<DeviceResponse>,
    fetch_image_metadata: bool,
}

impl Dispatcher {
    /// Create a dispatcher. With `fetch_image_metadata` set, every completed
    /// image produces a `get_image_metadata` follow-up command.
    pub fn new(fetch_image_metadata: bool) -> Self {
        Self {
            reassembler: Mutex::new(Reassembler::new()),
            status_waiters: Mutex::new(Vec::new()),
            responses: Handlers::new(),
            fetch_image_metadata,
        }
    }

    /// Response handler registry
    pub fn responses(&self) -> &Handlers<DeviceResponse> {
        &self.responses
    }

    /// Handle one raw frame. Returns commands the transport should send in
    /// reaction to it.
    pub fn handle_frame(&self, bytes: &[u8]) -> Vec<DeviceCommand> {
        match parse_frame(bytes) {
            Ok(inbound) => self.handle_inbound(inbound),
            Err(e) => {
                warn!("Dropping frame ({} bytes): {}", bytes.len(), e);
                Vec::new()
            }
        }
    }

    /// Handle a frame that arrived already decoded (relay envelopes)
    pub fn handle_value(&self, value: Value) -> Vec<DeviceCommand> {
        match parse_value(value) {
            Ok(inbound) => self.handle_inbound(inbound),
            Err(e) => {
                warn!("Dropping frame: {}", e);
                Vec::new()
            }
        }
    }

    fn handle_inbound(&self, inbound: Inbound) -> Vec<DeviceCommand> {
        let mut follow_ups = Vec::new();

        let response = match inbound {
            Inbound::Frame(frame) => self.reassemble(frame, &mut follow_ups),
            Inbound::LegacyLogs(items) => Some(DeviceResponse::Logs { logs: log_lines(items) }),
            Inbound::Unknown { kind, body } => {
                debug!("Unrecognized frame type {}", kind);
                Some(DeviceResponse::Other { kind, body })
            }
        };

        if let Some(response) = response {
            self.deliver(response);
        }
        follow_ups
    }

    /// Advance transfer state with one frame, yielding a response when the
    /// frame completes one
    fn reassemble(&self, frame: Frame, follow_ups: &mut Vec<DeviceCommand>) -> Option<DeviceResponse> {
        let mut reassembler = self.reassembler.lock().unwrap_or_else(|e| e.into_inner());

        match frame {
            Frame::Pong => Some(DeviceResponse::Pong),

            Frame::LogChunk(chunk) => {
                reassembler.push_log_chunk(chunk);
                None
            }
            Frame::LogsComplete(done) => Some(DeviceResponse::Logs {
                logs: reassembler.complete_logs(&done),
            }),

            Frame::ImageListChunk(chunk) => {
                reassembler.push_image_list_chunk(chunk);
                None
            }
            Frame::ImageListComplete(done) => Some(DeviceResponse::ImageList {
                images: reassembler.complete_image_list(&done),
            }),

            Frame::ImageStart(start) => {
                debug!("Receiving image {} ({:?} bytes)", start.filename, start.size);
                reassembler.start_image(start);
                None
            }
            Frame::ImageChunk(chunk) => {
                reassembler.push_image_chunk(chunk);
                None
            }
            Frame::ImageComplete(done) => {
                let image = reassembler.complete_image(&done)?;
                if self.fetch_image_metadata {
                    follow_ups.push(DeviceCommand::get_image_metadata(&image.filename));
                }
                Some(DeviceResponse::Image(image))
            }

            Frame::MetadataResult(result) => {
                let metadata = match result.metadata {
                    Some(metadata) => metadata,
                    None => Value::Object(result.extra),
                };
                Some(DeviceResponse::ImageMetadata {
                    filename: result.filename,
                    metadata,
                })
            }

            Frame::Settings(frame) => Some(DeviceResponse::Settings {
                settings: frame.settings.unwrap_or(frame.extra),
            }),
            Frame::SettingUpdated(frame) => Some(DeviceResponse::SettingUpdated {
                setting: frame.setting,
                value: frame.value,
            }),

            // An error while a transfer is open answers that transfer, not a
            // status query
            Frame::Error(frame) => {
                if reassembler.is_idle() {
                    self.resolve_status(Err(LinkError::DeviceError(frame.message.clone())));
                } else {
                    debug!("Error frame during a transfer, status waiters left pending");
                }
                Some(DeviceResponse::Error { message: frame.message })
            }

            Frame::Status(frame) => {
                let status = DeviceStatus { fields: frame.fields };
                if self.resolve_status(Ok(status.clone())) {
                    None
                } else {
                    Some(DeviceResponse::Status(status))
                }
            }
        }
    }

    /// Invoke every response handler
    pub fn deliver(&self, response: DeviceResponse) {
        debug!("Delivering {} response", response.kind());
        self.responses.emit(&response);
    }

    /// Register a one-shot status waiter
    pub fn wait_for_status(&self) -> oneshot::Receiver<Result<DeviceStatus, LinkError>> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.status_waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters.retain(|waiter| !waiter.is_closed());
        waiters.push(tx);
        rx
    }

    /// Complete pending status waiters. Returns true if any live waiter
    /// received the result.
    fn resolve_status(&self, result: Result<DeviceStatus, LinkError>) -> bool {
        let waiters: Vec<StatusWaiter> = {
            let mut waiters = self.status_waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.drain(..).filter(|waiter| !waiter.is_closed()).collect()
        };
        if waiters.is_empty() {
            return false;
        }

        for waiter in waiters {
            let reply = match &result {
                Ok(status) => Ok(status.clone()),
                Err(LinkError::DeviceError(message)) => Err(LinkError::DeviceError(message.clone())),
                Err(e) => Err(LinkError::Internal(e.to_string())),
            };
            let _ = waiter.send(reply);
        }
        true
    }

    /// Send `get_status` through `send` and wait for the matching reply.
    ///
    /// Fails with [`LinkError::Timeout`] when nothing arrives within
    /// `timeout`, and with [`LinkError::DeviceError`] when the device answers
    /// with an error frame. Frames carry no request id, so an error arriving
    /// while no transfer is open is taken as the answer to the query.
    pub async fn query_status<F>(&self, timeout: Duration, send: F) -> Result<DeviceStatus, LinkError>
    where
        F: Future<Output = Result<(), LinkError>>,
    {
        let reply = self.wait_for_status();
        send.await?;

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::NotConnected),
            Err(_) => Err(LinkError::Timeout(format!("status reply after {:?}", timeout))),
        }
    }

    /// Drop all transfer state and fail pending waits
    pub fn reset(&self) {
        self.reassembler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.status_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Whether no transfer is in flight
    pub fn is_idle(&self) -> bool {
        self.reassembler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_idle()
    }
}
