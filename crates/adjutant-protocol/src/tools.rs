//! The fleet tool set installed on every protocol session.

use std::{future::Future, sync::Arc};

use adjutant_core::{AgentRole, AgentState, AgentStatus, SessionId, Topology};
use adjutant_store::{
    EventFilter, EventStore, MarkRead, MessageStore, NewEvent, NewMessage, PageRequest, StoreError,
};
use adjutant_transport::{ChatHub, StatusHub};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    ProtocolError,
    manager::ToolRegistrar,
    session::{ProtocolSession, ToolDefinition, ToolHandler},
};

/// Work item tracker error.
#[derive(Debug, Error)]
pub enum WorkItemError {
    #[error("work item tracker unavailable")]
    Unavailable,
    #[error("work item not found: {0}")]
    NotFound(String),
    #[error("work item tracker failed: {0}")]
    Failed(String),
}

/// External issue/work-item tracker.
#[async_trait]
pub trait WorkItemClient: Send + Sync {
    /// List work items matching a tracker-specific filter.
    async fn list(&self, filter: Value) -> Result<Value, WorkItemError>;

    async fn show(&self, id: &str) -> Result<Value, WorkItemError>;
}

/// Stand-in used when no tracker is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableWorkItems;

#[async_trait]
impl WorkItemClient for UnavailableWorkItems {
    async fn list(&self, _filter: Value) -> Result<Value, WorkItemError> {
        Err(WorkItemError::Unavailable)
    }

    async fn show(&self, _id: &str) -> Result<Value, WorkItemError> {
        Err(WorkItemError::Unavailable)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageArgs {
    from: String,
    #[serde(default)]
    to: Option<String>,
    body: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesArgs {
    thread_id: Option<String>,
    session_id: Option<SessionId>,
    agent_id: Option<String>,
    #[serde(flatten)]
    page: PageRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadArgs {
    message_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetStatusArgs {
    agent_id: String,
    #[serde(default)]
    role: Option<String>,
    state: AgentState,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetStatusesArgs {
    agent_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryEventsArgs {
    #[serde(flatten)]
    filter: EventFilter,
    #[serde(flatten)]
    page: PageRequest,
}

#[derive(Debug, Deserialize)]
struct ShowWorkItemArgs {
    id: String,
}

/// Registrar for the standard fleet tools.
#[derive(Clone)]
pub struct FleetTools {
    messages: MessageStore,
    events: EventStore,
    chat: Arc<ChatHub>,
    status: Arc<StatusHub>,
    topology: Arc<dyn Topology>,
    work_items: Arc<dyn WorkItemClient>,
}

impl FleetTools {
    #[must_use]
    pub fn new(
        messages: MessageStore,
        events: EventStore,
        chat: Arc<ChatHub>,
        status: Arc<StatusHub>,
        topology: Arc<dyn Topology>,
    ) -> Self {
        Self {
            messages,
            events,
            chat,
            status,
            topology,
            work_items: Arc::new(UnavailableWorkItems),
        }
    }

    #[must_use]
    pub fn with_work_items(mut self, client: Arc<dyn WorkItemClient>) -> Self {
        self.work_items = client;
        self
    }

    async fn send_message(self, args: SendMessageArgs) -> Result<Value, ProtocolError> {
        let role = self.chat.peer(Some(args.from.as_str())).role;
        let new = NewMessage {
            session_id: args.session_id,
            sender_id: args.from.clone(),
            recipient_id: args.to.clone(),
            role,
            body: args.body,
            metadata: args.metadata,
            event_type: None,
            thread_id: args.thread_id.clone(),
        };
        let message = self.chat.send(new).await.map_err(store_error)?;

        let event = NewEvent::new("message_sent", &args.from, "send")
            .with_detail(json!({ "to": args.to, "threadId": args.thread_id }))
            .for_message(message.id);
        if let Err(e) = self.events.append(event).await {
            tracing::warn!(message = %message.id, error = %e, "Failed to record message_sent event");
        }

        to_value(&message)
    }

    async fn list_messages(self, args: ListMessagesArgs) -> Result<Value, ProtocolError> {
        let page = if let Some(thread) = &args.thread_id {
            self.messages.list_by_thread(thread, &args.page).await
        } else if let Some(session) = args.session_id {
            self.messages.list_by_session(session, &args.page).await
        } else if let Some(agent) = &args.agent_id {
            self.messages.list_by_agent(agent, &args.page).await
        } else {
            self.messages.list_recent(&args.page).await
        };
        to_value(&page.map_err(store_error)?)
    }

    async fn mark_read(self, args: MarkReadArgs) -> Result<Value, ProtocolError> {
        let outcome = self
            .messages
            .mark_read(args.message_id)
            .await
            .map_err(store_error)?;
        let already_read = matches!(outcome, MarkRead::AlreadyRead(_));
        if !already_read {
            self.chat.announce_read(args.message_id);
        }
        Ok(json!({ "messageId": args.message_id, "alreadyRead": already_read }))
    }

    async fn set_status(self, args: SetStatusArgs) -> Result<Value, ProtocolError> {
        if args.agent_id.trim().is_empty() {
            return Err(ProtocolError::InvalidParams("agentId must not be empty".to_string()));
        }
        let role = args.role.as_deref().map_or_else(
            || {
                self.topology
                    .parse_address(&args.agent_id)
                    .map_or(AgentRole::Unknown, |a| a.role)
            },
            |raw| self.topology.normalize_role(raw),
        );
        let status = AgentStatus {
            agent_id: args.agent_id,
            role,
            state: args.state,
            detail: args.detail,
            updated_at: Utc::now(),
        };
        self.status.set(status.clone());

        let event = NewEvent::new("status_changed", &status.agent_id, "set_status")
            .with_detail(json!({ "state": status.state, "detail": status.detail }));
        if let Err(e) = self.events.append(event).await {
            tracing::warn!(agent = %status.agent_id, error = %e, "Failed to record status event");
        }

        to_value(&status)
    }

    async fn get_statuses(self, args: GetStatusesArgs) -> Result<Value, ProtocolError> {
        match args.agent_id {
            Some(agent) => to_value(&self.status.get(&agent)),
            None => to_value(&self.status.snapshot()),
        }
    }

    async fn emit_event(self, args: NewEvent) -> Result<Value, ProtocolError> {
        let event = self.events.append(args).await.map_err(store_error)?;
        to_value(&event)
    }

    async fn query_events(self, args: QueryEventsArgs) -> Result<Value, ProtocolError> {
        let page = self
            .events
            .query(&args.filter, &args.page)
            .await
            .map_err(store_error)?;
        to_value(&page)
    }

    async fn list_work_items(self, args: Value) -> Result<Value, ProtocolError> {
        self.work_items.list(args).await.map_err(work_item_error)
    }

    async fn show_work_item(self, args: ShowWorkItemArgs) -> Result<Value, ProtocolError> {
        self.work_items.show(&args.id).await.map_err(work_item_error)
    }
}

#[async_trait]
impl ToolRegistrar for FleetTools {
    async fn register_tools(&self, session: &ProtocolSession) -> Result<(), ProtocolError> {
        let t = self.clone();
        session.register_tool(
            definition(
                "send_message",
                "Send a chat message to an agent or the user",
                json!({
                    "type": "object",
                    "properties": {
                        "from": { "type": "string", "description": "Sender agent address" },
                        "to": { "type": "string", "description": "Recipient; omit to broadcast" },
                        "body": { "type": "string" },
                        "threadId": { "type": "string" },
                        "sessionId": { "type": "string", "format": "uuid" },
                        "metadata": { "type": "object" }
                    },
                    "required": ["from", "body"]
                }),
            ),
            typed(move |a| t.clone().send_message(a)),
        )?;

        let t = self.clone();
        session.register_tool(
            definition(
                "list_messages",
                "List messages, newest first, by thread, session, agent, or all",
                json!({
                    "type": "object",
                    "properties": {
                        "threadId": { "type": "string" },
                        "sessionId": { "type": "string", "format": "uuid" },
                        "agentId": { "type": "string" },
                        "cursor": { "type": "string" },
                        "limit": { "type": "integer", "minimum": 1, "maximum": 200 }
                    }
                }),
            ),
            typed(move |a| t.clone().list_messages(a)),
        )?;

        let t = self.clone();
        session.register_tool(
            definition(
                "mark_read",
                "Mark a message as read",
                json!({
                    "type": "object",
                    "properties": { "messageId": { "type": "string", "format": "uuid" } },
                    "required": ["messageId"]
                }),
            ),
            typed(move |a| t.clone().mark_read(a)),
        )?;

        let t = self.clone();
        session.register_tool(
            definition(
                "set_status",
                "Report what an agent is doing",
                json!({
                    "type": "object",
                    "properties": {
                        "agentId": { "type": "string" },
                        "role": { "type": "string" },
                        "state": {
                            "type": "string",
                            "enum": ["idle", "working", "blocked", "done", "offline"]
                        },
                        "detail": { "type": "string" }
                    },
                    "required": ["agentId", "state"]
                }),
            ),
            typed(move |a| t.clone().set_status(a)),
        )?;

        let t = self.clone();
        session.register_tool(
            definition(
                "get_statuses",
                "Last reported status of one agent, or of every agent",
                json!({
                    "type": "object",
                    "properties": { "agentId": { "type": "string" } }
                }),
            ),
            typed(move |a| t.clone().get_statuses(a)),
        )?;

        let t = self.clone();
        session.register_tool(
            definition(
                "emit_event",
                "Append an event to the audit log",
                json!({
                    "type": "object",
                    "properties": {
                        "eventType": { "type": "string" },
                        "agentId": { "type": "string" },
                        "action": { "type": "string" },
                        "detail": {},
                        "workItemId": { "type": "string" },
                        "messageId": { "type": "string", "format": "uuid" }
                    },
                    "required": ["eventType", "agentId", "action"]
                }),
            ),
            typed(move |a| t.clone().emit_event(a)),
        )?;

        let t = self.clone();
        session.register_tool(
            definition(
                "query_events",
                "Query the audit log, newest first",
                json!({
                    "type": "object",
                    "properties": {
                        "type": { "type": "string" },
                        "agentId": { "type": "string" },
                        "workItemId": { "type": "string" },
                        "cursor": { "type": "string" },
                        "limit": { "type": "integer", "minimum": 1, "maximum": 200 }
                    }
                }),
            ),
            typed(move |a| t.clone().query_events(a)),
        )?;

        let t = self.clone();
        session.register_tool(
            definition(
                "list_work_items",
                "List work items from the tracker",
                json!({ "type": "object" }),
            ),
            move |a: Value| t.clone().list_work_items(a),
        )?;

        let t = self.clone();
        session.register_tool(
            definition(
                "show_work_item",
                "Show one work item",
                json!({
                    "type": "object",
                    "properties": { "id": { "type": "string" } },
                    "required": ["id"]
                }),
            ),
            typed(move |a| t.clone().show_work_item(a)),
        )?;

        Ok(())
    }
}

fn definition(name: &str, description: &str, input_schema: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

/// Wrap a handler taking typed arguments. Absent arguments read as `{}`.
fn typed<A, F, Fut>(f: F) -> impl ToolHandler
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProtocolError>> + Send + 'static,
{
    move |args: Value| {
        let args = if args.is_null() { json!({}) } else { args };
        let call = serde_json::from_value::<A>(args)
            .map(&f)
            .map_err(|e| ProtocolError::InvalidParams(e.to_string()));
        async move { call?.await }
    }
}

fn to_value(value: &impl serde::Serialize) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Tool(e.to_string()))
}

fn store_error(e: StoreError) -> ProtocolError {
    match e {
        StoreError::InvalidCursor(_) => ProtocolError::InvalidParams(e.to_string()),
        other => ProtocolError::Tool(other.to_string()),
    }
}

#[allow(clippy::needless_pass_by_value)]
fn work_item_error(e: WorkItemError) -> ProtocolError {
    ProtocolError::Tool(e.to_string())
}
