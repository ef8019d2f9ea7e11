//! SMM Provider Connectors
//!
//! HTTP adapters for upstream fulfillment panels.
//! Normalizes panel-specific answers to the provider-agnostic port types.

#![warn(clippy::all)]

// Public modules
pub mod factory;
pub mod standard;

// Re-exports
pub use factory::ProviderAdapterFactory;
pub use standard::{StandardSmmClient, UpstreamError, DEFAULT_TIMEOUT_SECS};
