//! # pimsync - PIM Data Synchronization Engine
//!
//! pimsync synchronizes PIM data (contacts, calendar events, tasks, notes)
//! between local data sources and remote SyncML-style peers. The crate
//! provides the session orchestration layer: a layered configuration
//! store, per-source change tracking, a priority session scheduler exposed
//! over an IPC bus, transport bindings and auto-sync based on transport
//! presence.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pimsync::server::{Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(ServerOptions {
//!         config_root: None,
//!         engine: pimsync::engine::local_engine_factory(),
//!         backends: std::sync::Arc::new(pimsync::source::BackendRegistry::new()),
//!         auto_term_duration: Some(std::time::Duration::from_secs(600)),
//!     });
//!     server.run().await;
//! }
//! ```

#![deny(unsafe_code)]

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod info;
pub mod logging;
pub mod progress;
pub mod report;
pub mod san;
pub mod server;
pub mod session;
pub mod source;
pub mod status;
pub mod transport;

// Re-export commonly used types
pub use config::{ConfigFilter, ConfigMap, FileConfigTree, PeerConfig};
pub use error::{BusError, ConfigError, SourceError, SyncError, TransportError};
pub use session::Session;
pub use source::tracking::TrackingSource;
pub use status::{SessionState, SyncMode, SyncStatus};

// vim: ts=4
