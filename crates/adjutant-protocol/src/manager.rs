//! Protocol session lifecycle.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    ProtocolError,
    jsonrpc::JsonRpcNotification,
    session::{ProtocolSession, ToolDefinition},
};

/// Installs the tool set on a freshly created session.
#[async_trait]
pub trait ToolRegistrar: Send + Sync {
    async fn register_tools(&self, session: &ProtocolSession) -> Result<(), ProtocolError>;
}

/// Creates, looks up and tears down protocol sessions.
///
/// Sessions are refused until a registrar is installed, so no client ever
/// sees a session without its tools.
#[derive(Default)]
pub struct ProtocolSessionManager {
    registrar: OnceLock<Arc<dyn ToolRegistrar>>,
    sessions: RwLock<HashMap<Uuid, Arc<ProtocolSession>>>,
}

impl ProtocolSessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the registrar. Only the first call wins.
    ///
    /// # Errors
    /// Returns `AlreadyRegistered` on any later call.
    pub fn set_registrar(&self, registrar: Arc<dyn ToolRegistrar>) -> Result<(), ProtocolError> {
        self.registrar
            .set(registrar)
            .map_err(|_| ProtocolError::AlreadyRegistered)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.registrar.get().is_some()
    }

    /// Create a session with every tool installed.
    ///
    /// # Errors
    /// Returns `NotReady` before `set_registrar`, or the registrar's error.
    pub async fn create_session(&self) -> Result<Arc<ProtocolSession>, ProtocolError> {
        let registrar = self.registrar.get().ok_or(ProtocolError::NotReady)?;
        let session = Arc::new(ProtocolSession::new());
        registrar.register_tools(&session).await?;
        session.seal();

        let id = session.id();
        self.sessions.write().await.insert(id, Arc::clone(&session));
        tracing::debug!(session = %id, tools = session.tools().len(), "Protocol session created");
        Ok(session)
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<ProtocolSession>> {
        self.sessions.read().await.get(&id).cloned()
    }

    async fn open(&self, id: Uuid) -> Result<Arc<ProtocolSession>, ProtocolError> {
        self.get(id).await.ok_or(ProtocolError::SessionNotFound(id))
    }

    /// Invoke a tool on a session.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `SessionClosed`, `UnknownTool`, or the tool's error.
    pub async fn call_tool(&self, id: Uuid, name: &str, args: Value) -> Result<Value, ProtocolError> {
        self.open(id).await?.call(name, args).await
    }

    /// # Errors
    /// Returns `SessionNotFound` for an unknown id.
    pub async fn list_tools(&self, id: Uuid) -> Result<Vec<ToolDefinition>, ProtocolError> {
        Ok(self.open(id).await?.tools())
    }

    /// Close a session. Calls already admitted finish; new ones fail.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for an unknown id.
    pub async fn teardown(&self, id: Uuid) -> Result<(), ProtocolError> {
        let session = self.open(id).await?;
        session.close();
        self.sessions.write().await.remove(&id);
        tracing::debug!(session = %id, "Protocol session closed");
        Ok(())
    }

    /// Push a notification to every open session.
    pub async fn notify_all(&self, notification: &JsonRpcNotification) {
        for session in self.sessions.read().await.values() {
            session.notify(notification.clone());
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
