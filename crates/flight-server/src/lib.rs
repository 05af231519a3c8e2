//! Server side of the flight transport.
//!
//! This crate provides:
//! - `FlightHandler` - Serves rendering and action requests over `http` types
//! - `FlightRoute` / `parse_request` - Request parsing for the flight endpoint
//! - `LocalTransport` - In-process client transport backed by a handler

mod handler;
mod local;
mod request;

pub use handler::*;
pub use local::*;
pub use request::*;
