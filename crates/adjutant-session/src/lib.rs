//! Session bridge for supervised agent terminal sessions.
//!
//! Provides:
//! - `SessionBridge` - Create, verify, reconcile and tear down sessions
//! - `Registry` - Durable on-disk copy of the session table

pub mod bridge;
pub mod error;
pub mod registry;

pub use bridge::{BridgeConfig, ReconcileReport, RecoveryReport, SessionBridge, SessionChange};
pub use error::BridgeError;
pub use registry::{Registry, RegistryEntry, RegistryError};
