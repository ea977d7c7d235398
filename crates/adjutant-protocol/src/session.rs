//! One isolated tool-protocol session.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{ProtocolError, jsonrpc::JsonRpcNotification};

const NOTIFICATION_CAPACITY: usize = 64;

/// Tool definition as listed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Handler invoked for one tool call.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<Value, ProtocolError>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ProtocolError>> + Send,
{
    async fn call(&self, args: Value) -> Result<Value, ProtocolError> {
        self(args).await
    }
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

/// Handler table and notification channel for one protocol client.
pub struct ProtocolSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
    sealed: AtomicBool,
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
    notifications: RwLock<Option<broadcast::Sender<JsonRpcNotification>>>,
}

impl ProtocolSession {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
            tools: RwLock::new(BTreeMap::new()),
            notifications: RwLock::new(Some(tx)),
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Install a tool. A later registration under the same name replaces
    /// the earlier one. Only possible while the registrar runs, before the
    /// session is handed out.
    ///
    /// # Errors
    /// Returns `RegistrationClosed` once the session is published and
    /// `SessionClosed` once it is torn down.
    pub fn register_tool(
        &self,
        definition: ToolDefinition,
        handler: impl ToolHandler + 'static,
    ) -> Result<(), ProtocolError> {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return Err(ProtocolError::SessionClosed(self.id));
        }
        if self.sealed.load(Ordering::Acquire) {
            return Err(ProtocolError::RegistrationClosed(self.id));
        }
        tools.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    /// Installed tools, ordered by name.
    #[must_use]
    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|t| t.definition.clone())
            .collect()
    }

    /// Invoke a tool by name.
    ///
    /// # Errors
    /// Returns `SessionClosed`, `UnknownTool`, or whatever the handler fails with.
    pub async fn call(&self, name: &str, args: Value) -> Result<Value, ProtocolError> {
        let handler = {
            let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
            if self.is_closed() {
                return Err(ProtocolError::SessionClosed(self.id));
            }
            tools
                .get(name)
                .map(|t| Arc::clone(&t.handler))
                .ok_or_else(|| ProtocolError::UnknownTool(name.to_string()))?
        };
        handler.call(args).await
    }

    /// Push a notification to this session's stream, if anyone listens.
    pub fn notify(&self, notification: JsonRpcNotification) {
        if let Some(tx) = self
            .notifications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = tx.send(notification);
        }
    }

    /// Subscribe to this session's notifications. `None` after teardown.
    #[must_use]
    pub fn notifications(&self) -> Option<broadcast::Receiver<JsonRpcNotification>> {
        self.notifications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    /// Freeze the tool table.
    pub(crate) fn seal(&self) {
        let _tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        self.sealed.store(true, Ordering::Release);
    }

    /// Refuse new calls, then drop handlers and the notification sender.
    /// Open notification streams end once the sender is gone.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.notifications
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl std::fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo() -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: "Echo arguments".to_string(),
            input_schema: json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn calls_reach_registered_handlers() {
        let session = ProtocolSession::new();
        session
            .register_tool(echo(), |args: Value| async move { Ok::<_, ProtocolError>(args) })
            .unwrap();

        assert_eq!(session.tools(), [echo()]);
        assert_eq!(session.call("echo", json!({"x": 1})).await.unwrap(), json!({"x": 1}));
        assert!(matches!(
            session.call("nope", json!({})).await,
            Err(ProtocolError::UnknownTool(name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn closed_sessions_refuse_everything() {
        let session = ProtocolSession::new();
        session
            .register_tool(echo(), |args: Value| async move { Ok::<_, ProtocolError>(args) })
            .unwrap();
        let mut rx = session.notifications().unwrap();

        session.close();

        assert!(session.is_closed());
        assert!(session.tools().is_empty());
        assert!(matches!(
            session.call("echo", json!({})).await,
            Err(ProtocolError::SessionClosed(_))
        ));
        assert!(matches!(
            session.register_tool(echo(), |args: Value| async move { Ok::<_, ProtocolError>(args) }),
            Err(ProtocolError::SessionClosed(_))
        ));
        assert!(session.notifications().is_none());
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn notifications_fan_out() {
        let session = ProtocolSession::new();
        let mut rx = session.notifications().unwrap();
        session.notify(JsonRpcNotification::new("notifications/message", None));
        assert_eq!(rx.recv().await.unwrap().method, "notifications/message");
    }
}
