use thiserror::Error;
use uuid::Uuid;

use crate::jsonrpc::{
    INTERNAL_ERROR, INVALID_PARAMS, JsonRpcError, METHOD_NOT_FOUND, NOT_READY, SESSION_NOT_FOUND,
};

/// Protocol session error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("tool registrar not installed yet")]
    NotReady,
    #[error("tool registrar already installed")]
    AlreadyRegistered,
    #[error("protocol session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("protocol session closed: {0}")]
    SessionClosed(Uuid),
    #[error("tools can only be registered before the session is published: {0}")]
    RegistrationClosed(Uuid),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Tool(String),
}

impl ProtocolError {
    /// JSON-RPC error code for this error.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::NotReady => NOT_READY,
            Self::SessionNotFound(_) | Self::SessionClosed(_) => SESSION_NOT_FOUND,
            Self::UnknownTool(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::AlreadyRegistered | Self::RegistrationClosed(_) | Self::Tool(_) => {
                INTERNAL_ERROR
            }
        }
    }
}

impl From<&ProtocolError> for JsonRpcError {
    fn from(e: &ProtocolError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}
