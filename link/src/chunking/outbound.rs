//! Splitting of oversized commands for packet-limited links.
//!
//! A command whose serialized form fits in one packet goes out as-is.
//! Larger commands are cut into fixed-size pieces, each wrapped in its own
//! JSON frame with `chunk_index` and `total_chunks`, and written one after
//! another with a short pause. Nothing acknowledges individual chunks.
//!
//! For `ota_update` the signed URL is the chunked payload (`url_chunk`
//! frames carrying the firmware version); any other oversized command is
//! chunked as its serialized JSON (`command_chunk` frames).

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::errors::LinkError;
use crate::models::{CommandKind, DeviceCommand};

/// Largest command written as a single packet
pub const MAX_SINGLE_PACKET: usize = 512;

/// Payload bytes per chunk frame, leaving room for the JSON envelope
pub const CHUNK_DATA_SIZE: usize = 400;

/// Pause between consecutive chunk writes
pub const INTER_CHUNK_DELAY: Duration = Duration::from_millis(50);

/// Chunking parameters
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub max_single_packet: usize,
    pub chunk_data_size: usize,
    pub inter_chunk_delay: Duration,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_single_packet: MAX_SINGLE_PACKET,
            chunk_data_size: CHUNK_DATA_SIZE,
            inter_chunk_delay: INTER_CHUNK_DELAY,
        }
    }
}

/// Envelope of one outbound chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkEnvelope<'a> {
    pub action: &'static str,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub chunk_data: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<&'a str>,
}

/// Frames to write for one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPlan {
    Single(Vec<u8>),
    Chunked(Vec<Vec<u8>>),
}

impl OutboundPlan {
    pub fn frames(&self) -> usize {
        match self {
            OutboundPlan::Single(_) => 1,
            OutboundPlan::Chunked(frames) => frames.len(),
        }
    }
}

/// Serialize a command and decide how it goes on the wire
pub fn plan_command(command: &DeviceCommand, options: &ChunkOptions) -> Result<OutboundPlan, LinkError> {
    let bytes = command.to_bytes()?;
    if bytes.len() <= options.max_single_packet {
        return Ok(OutboundPlan::Single(bytes));
    }

    let ota_url = match command.command {
        CommandKind::OtaUpdate => command.field_str("url"),
        _ => None,
    };

    let frames = match ota_url {
        Some(url) => chunk_frames(
            "url_chunk",
            url,
            command.field_str("version"),
            options.chunk_data_size,
        )?,
        None => {
            let serialized = String::from_utf8(bytes)
                .map_err(|e| LinkError::Internal(format!("Command is not UTF-8: {}", e)))?;
            chunk_frames("command_chunk", &serialized, None, options.chunk_data_size)?
        }
    };

    debug!(
        "{} command is {} bytes, sending as {} chunks",
        command.command.as_str(),
        command.to_bytes()?.len(),
        frames.len()
    );
    Ok(OutboundPlan::Chunked(frames))
}

/// Wrap each piece of `payload` in a chunk envelope
pub fn chunk_frames(
    action: &'static str,
    payload: &str,
    version: Option<&str>,
    chunk_data_size: usize,
) -> Result<Vec<Vec<u8>>, LinkError> {
    let pieces = split_utf8(payload, chunk_data_size);
    let total_chunks = pieces.len() as u32;

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            let envelope = ChunkEnvelope {
                action,
                chunk_index: i as u32,
                total_chunks,
                chunk_data: piece,
                version,
            };
            serde_json::to_vec(&envelope).map_err(LinkError::from)
        })
        .collect()
}

/// Split `s` into pieces of at most `max_bytes` bytes without cutting a
/// UTF-8 character. A character wider than `max_bytes` gets its own piece.
pub fn split_utf8(s: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(1);
    let mut pieces = Vec::with_capacity(s.len().div_ceil(max_bytes));
    let mut rest = s;

    while !rest.is_empty() {
        let mut end = max_bytes.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let (piece, tail) = rest.split_at(end);
        pieces.push(piece);
        rest = tail;
    }
    pieces
}

/// Write frames in order, pausing `delay` between consecutive writes
pub async fn send_frames<W, F>(frames: Vec<Vec<u8>>, delay: Duration, mut write: W) -> Result<(), LinkError>
where
    W: FnMut(Vec<u8>) -> F,
    F: Future<Output = Result<(), LinkError>>,
{
    let total = frames.len();
    for (i, frame) in frames.into_iter().enumerate() {
        write(frame).await?;
        if i + 1 < total {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(())
}
