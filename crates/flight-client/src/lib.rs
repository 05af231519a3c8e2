//! Client side of the flight transport.
//!
//! This crate provides:
//! - `ClientFlightCache` - Request coalescing and caching keyed by `FlightKey`
//! - `FlightHandle` - Incrementally decoded result of one rendering request
//! - `ServerActionBridge` - Server action calls with mutation mode routing
//! - `FlightTransport` - The HTTP seam, with a blocking-client implementation

mod action;
mod cache;
mod handle;
mod transport;

pub use action::*;
pub use cache::*;
pub use handle::*;
pub use transport::*;
