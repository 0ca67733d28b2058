//! Chunked transfer handling in both directions

pub mod outbound;
pub mod reassembler;

pub use outbound::{plan_command, send_frames, ChunkOptions, OutboundPlan};
pub use reassembler::{ChunkAccumulator, Reassembler, TransferKind};
