//! SMM Daemon Library
//!
//! Runtime orchestrator for the SMM fulfillment pipeline.
//!
//! # Architecture
//!
//! ```text
//! HTTP → Caller gate → OrderPlacementService → Ledger + Order Store
//!                                 │
//!                           DispatchQueue
//!                                 │
//!                   FulfillmentWorker pool → Upstream providers
//!                                 ↑
//!                 Reconciler / RateSync (periodic)
//! ```
//!
//! # Components
//!
//! - **Daemon**: Main runtime orchestrator
//! - **API**: HTTP endpoints for customers and operators
//! - **Caller**: Per-request capability gate
//! - **Config**: Environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use smmd::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let daemon = Daemon::new_stub(config);
//!     daemon.run().await.expect("Daemon error");
//! }
//! ```

#![warn(clippy::all)]

pub mod api;
pub mod caller;
pub mod config;
pub mod daemon;
pub mod error;

#[cfg(feature = "postgres")]
pub mod db;

// Re-exports for convenience
pub use api::{create_router, ApiState};
pub use caller::{Caller, Role};
pub use config::{ApiConfig, Config, DispatchConfig, Environment, ReconcileConfig, UpstreamConfig};
pub use daemon::Daemon;
pub use error::{DaemonError, DaemonResult};
