//! Shared utilities for MeshTunnel components.
//!
//! This crate provides the functionality used by both the provider and the
//! consumer side of a MeshTunnel node: configuration, logging, cryptographic
//! identities and the market types exchanged through discovery.

pub mod config;
pub mod identity;
pub mod logging;
pub mod market;

// Re-export commonly used types for convenience
pub use config::{Config, ConfigError};
pub use identity::{Identity, IdentityError, IdentityResult};
pub use market::{Contact, Location, PaymentRate, ServiceProposal};
