use adjutant_core::SessionId;
use adjutant_tmux::MuxError;
use thiserror::Error;

use crate::registry::RegistryError;

/// Session bridge error.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("session name already in use: {0}")]
    Conflict(String),
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session was pruned: {0}")]
    Pruned(SessionId),
    #[error("multiplexer error: {0}")]
    Multiplexer(#[from] MuxError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}
