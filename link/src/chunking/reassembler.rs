//! Reassembly of chunked device responses.
//!
//! Each transfer kind owns at most one open accumulator. A `*_start` (or the
//! first `*_chunk` when no start frame exists for the kind) opens it, chunks
//! are stored by index, and the matching `*_complete` removes it and joins
//! the chunks in index order. Completion never checks the declared chunk
//! count against what arrived; a mismatch is logged and the partial payload
//! is delivered as-is.
//!
//! Every kind joins its chunks with the empty separator. Log text that needs
//! line breaks carries them inside the chunk data.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::models::response::{ChunkFrame, CompleteFrame, ImageListChunkFrame, ImageStartFrame};
use crate::models::{ImageEntry, ImagePayload, LogPayload};

/// In-flight transfer kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Logs,
    Image,
    ImageList,
}

/// Ordered chunk storage for one transfer
#[derive(Debug, Clone)]
pub struct ChunkAccumulator<T> {
    chunks: BTreeMap<u32, T>,
    declared_total: Option<u32>,
    next_index: u32,
}

impl<T> ChunkAccumulator<T> {
    pub fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
            declared_total: None,
            next_index: 0,
        }
    }

    /// Store a chunk. Chunks without an index take the slot after the
    /// highest index seen so far.
    pub fn push(&mut self, index: Option<u32>, total: Option<u32>, data: T) {
        let index = index.unwrap_or(self.next_index);
        self.next_index = self.next_index.max(index.saturating_add(1));
        if total.is_some() {
            self.declared_total = total;
        }
        if self.chunks.insert(index, data).is_some() {
            debug!("Chunk {} received twice, keeping the latest", index);
        }
    }

    pub fn declare_total(&mut self, total: Option<u32>) {
        if total.is_some() {
            self.declared_total = total;
        }
    }

    /// Number of distinct chunks stored
    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    pub fn declared_total(&self) -> Option<u32> {
        self.declared_total
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks in index order
    pub fn into_ordered(self) -> impl Iterator<Item = T> {
        self.chunks.into_values()
    }
}

impl<T> Default for ChunkAccumulator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkAccumulator<String> {
    /// Concatenate the chunks in index order
    pub fn join(self) -> String {
        self.into_ordered().collect()
    }
}

/// An image transfer opened by `image_start`
#[derive(Debug, Clone)]
struct ImageTransfer {
    filename: Option<String>,
    size: Option<u64>,
    chunks: ChunkAccumulator<String>,
}

/// Per-kind reassembly state for one transport session
#[derive(Debug, Default)]
pub struct Reassembler {
    logs: Option<ChunkAccumulator<String>>,
    image: Option<ImageTransfer>,
    image_list: Option<ChunkAccumulator<Vec<ImageEntry>>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an accumulator of `kind` is open
    pub fn in_flight(&self, kind: TransferKind) -> bool {
        match kind {
            TransferKind::Logs => self.logs.is_some(),
            TransferKind::Image => self.image.is_some(),
            TransferKind::ImageList => self.image_list.is_some(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.logs.is_none() && self.image.is_none() && self.image_list.is_none()
    }

    /// Drop every open accumulator
    pub fn clear(&mut self) {
        if !self.is_idle() {
            debug!("Discarding in-flight transfers");
        }
        self.logs = None;
        self.image = None;
        self.image_list = None;
    }

    // ----------------------------------- logs ----------------------------------- //

    pub fn push_log_chunk(&mut self, frame: ChunkFrame) {
        self.logs
            .get_or_insert_with(ChunkAccumulator::new)
            .push(frame.chunk, frame.total, frame.data);
    }

    /// Close the log transfer and decode whatever arrived
    pub fn complete_logs(&mut self, frame: &CompleteFrame) -> LogPayload {
        let mut chunks = self.logs.take().unwrap_or_default();
        chunks.declare_total(frame.total);
        check_count(TransferKind::Logs, &chunks);
        decode_logs(&chunks.join(), frame.format.as_deref())
    }

    // -------------------------------- image list -------------------------------- //

    pub fn push_image_list_chunk(&mut self, frame: ImageListChunkFrame) {
        let entries = frame.images.iter().filter_map(ImageEntry::from_value).collect();
        self.image_list
            .get_or_insert_with(ChunkAccumulator::new)
            .push(frame.chunk, frame.total, entries);
    }

    pub fn complete_image_list(&mut self, frame: &CompleteFrame) -> Vec<ImageEntry> {
        let mut chunks = self.image_list.take().unwrap_or_default();
        chunks.declare_total(frame.total);
        check_count(TransferKind::ImageList, &chunks);
        chunks.into_ordered().flatten().collect()
    }

    // ----------------------------------- image ---------------------------------- //

    /// Open an image transfer, discarding any stale one
    pub fn start_image(&mut self, frame: ImageStartFrame) {
        if let Some(stale) = self.image.take() {
            warn!(
                "image_start for {} replaces unfinished transfer of {:?} ({} chunks)",
                frame.filename,
                stale.filename,
                stale.chunks.received()
            );
        }
        let mut chunks = ChunkAccumulator::new();
        chunks.declare_total(frame.total);
        self.image = Some(ImageTransfer {
            filename: Some(frame.filename),
            size: frame.size,
            chunks,
        });
    }

    pub fn push_image_chunk(&mut self, frame: ChunkFrame) {
        let transfer = self.image.get_or_insert_with(|| ImageTransfer {
            filename: None,
            size: None,
            chunks: ChunkAccumulator::new(),
        });
        if transfer.filename.is_none() {
            transfer.filename = frame.filename;
        }
        transfer.chunks.push(frame.chunk, frame.total, frame.data);
    }

    /// Close the image transfer. Returns `None` when no transfer was open or
    /// no filename is known for it.
    pub fn complete_image(&mut self, frame: &CompleteFrame) -> Option<ImagePayload> {
        let Some(mut transfer) = self.image.take() else {
            warn!("image_complete without an open image transfer");
            return None;
        };
        transfer.chunks.declare_total(frame.total);
        check_count(TransferKind::Image, &transfer.chunks);

        let Some(filename) = transfer.filename.or_else(|| frame.filename.clone()) else {
            warn!("image_complete for a transfer with no filename, dropping");
            return None;
        };
        let base64 = transfer.chunks.join();
        Some(ImagePayload::from_base64(filename, transfer.size, &base64))
    }
}

/// Warn when the declared chunk count disagrees with what arrived
fn check_count<T>(kind: TransferKind, chunks: &ChunkAccumulator<T>) {
    if let Some(declared) = chunks.declared_total() {
        if declared as usize != chunks.received() {
            warn!(
                "{:?} transfer completed with {} of {} declared chunks",
                kind,
                chunks.received(),
                declared
            );
        }
    }
}

/// Interpret joined log text as a JSON array of lines or as raw text.
///
/// `format == "json"` forces the array parse (falling back to raw text if it
/// fails); with no format the array parse is attempted when the text looks
/// like an array.
pub fn decode_logs(text: &str, format: Option<&str>) -> LogPayload {
    let try_json = match format {
        Some(format) => format.eq_ignore_ascii_case("json"),
        None => text.trim_start().starts_with('['),
    };
    if try_json {
        if let Ok(items) = serde_json::from_str::<Vec<Value>>(text) {
            return log_lines(items);
        }
        debug!("Log payload is not a JSON array, delivering raw text");
    }
    LogPayload::Text(text.to_string())
}

/// Lines from a JSON array, stringifying non-string entries
pub fn log_lines(items: Vec<Value>) -> LogPayload {
    LogPayload::Lines(
        items
            .into_iter()
            .map(|item| match item {
                Value::String(line) => line,
                other => other.to_string(),
            })
            .collect(),
    )
}
