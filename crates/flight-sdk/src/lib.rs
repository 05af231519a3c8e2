//! Public SDK for the flight component streaming transport.
//!
//! This crate re-exports the host, server and client halves:
//!
//! ```ignore
//! use flight_sdk::prelude::*;
//!
//! let registry = ModuleRegistry::new()
//!     .with_component("Page", component_fn(|props| Ok(json!({ "id": props["id"] }))));
//! let channel = RenderWorkerChannel::spawn(
//!     RenderContext::new(registry, &config.manifest.output),
//!     config.channel.clone(),
//! );
//! channel.set_client_entries(ClientEntriesSource::LoadDefault).await?;
//!
//! let handler = FlightHandler::new(Arc::new(channel), &config.client);
//! let cache = ClientFlightCache::new(LocalTransport::new(handler), config.client.clone());
//!
//! let page = cache.request("Page", r#"{"id":1}"#);
//! let tree = page.root().await?;
//! ```

pub use flight_client;
pub use flight_core;
pub use flight_manifest;
pub use flight_observability;
pub use flight_server;
pub use flight_streaming;
pub use flight_worker;

/// Prelude for convenient imports.
pub mod prelude {
    pub use flight_client::*;
    pub use flight_core::*;
    pub use flight_manifest::*;
    pub use flight_observability::*;
    pub use flight_server::*;
    pub use flight_streaming::*;
    pub use flight_worker::*;
}
