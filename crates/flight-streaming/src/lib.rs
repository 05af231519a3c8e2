//! Ordered, flow-controlled assembly of chunked flight payloads.
//!
//! This crate turns per-call chunk frames into a single output stream:
//! - `FlightStreamAssembler` / `FlightStream` - Producer and consumer halves
//! - `PayloadSink` - Drives a stream into any `Sink<Vec<u8>>`
//! - `FlushPolicy` - Explicit coalescing control

mod assembler;
mod flush;
mod sink;

pub use assembler::*;
pub use flush::*;
pub use sink::*;

use flight_core::{encode_row, FlightError, Row, RowId};

/// Row id used for an error appended after streaming already started.
pub const TRAILER_ROW: RowId = RowId::MAX;

/// Error row appended to a payload whose headers are already sent.
pub fn error_trailer(err: &FlightError) -> Vec<u8> {
    let row = Row::error(TRAILER_ROW, err.to_serialized());
    encode_row(&row).unwrap_or_else(|_| format!("{:x}:E{{}}\n", TRAILER_ROW).into_bytes())
}
