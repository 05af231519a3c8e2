//! Request/stream channel between a host and an isolated rendering context.
//!
//! This crate provides:
//! - `RenderWorkerChannel` - Correlated RPC facade with per-call streams
//! - `RenderContext` - The isolated side that renders components and runs actions
//! - `ModuleRegistry` - Explicit registry of server components and actions
//! - `RenderScope` - Row writer handed to components while they render

mod channel;
mod context;
mod registry;
mod router;
mod scope;

pub use channel::*;
pub use context::*;
pub use registry::*;
pub use scope::*;
