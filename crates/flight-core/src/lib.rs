//! Core protocol types for the flight component streaming transport.
//!
//! This crate provides the fundamental types shared by host and client:
//! - `WorkerRequest` / `WorkerEvent` - Channel envelopes
//! - `FlightError` / `SerializedError` - Error taxonomy
//! - `FlightKey` / `RenderInput` - Rendering request identity
//! - `FlightDecoder` / `encode_row` - Incremental flight row codec
//! - `MultipartBody` - Binary-safe action argument encoding
//! - `FlightConfig` - Workspace configuration

mod config;
mod envelope;
mod error;
mod identity;
mod multipart;
mod query;
mod row;

pub use config::*;
pub use envelope::*;
pub use error::*;
pub use identity::*;
pub use multipart::*;
pub use query::*;
pub use row::*;

/// Header marking an HTTP request as a flight rendering request.
pub const RSC_HEADER: &str = "rw-rsc";

/// Content type of a streamed flight payload.
pub const FLIGHT_CONTENT_TYPE: &str = "text/x-component";
