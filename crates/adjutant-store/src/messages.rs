//! Chat message store.
//!
//! Every inserted message rests at `delivered`: fan-out to attached viewers
//! happens synchronously in the caller right after the insert, so there is
//! no queue in which a message could sit as `sent`. Status only ever moves
//! forward.

use std::{collections::BTreeMap, fmt, str::FromStr};

use adjutant_core::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::{
    StoreError,
    page::{Cursor, Page, PageRequest},
};

/// Who a message is from, conversationally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
    System,
    Announcement,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
            Self::Announcement => "announcement",
        }
    }
}

impl FromStr for MessageRole {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            "announcement" => Ok(Self::Announcement),
            other => Err(StoreError::Corrupt {
                column: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// Delivery lifecycle stage of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    const fn rank(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }

    /// Whether moving from `self` to `next` goes forward.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(StoreError::Corrupt {
                column: "delivery_status",
                value: other.to_string(),
            }),
        }
    }
}

/// A stored chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub session_id: Option<SessionId>,
    pub sender_id: String,
    /// `None` means broadcast to every viewer.
    pub recipient_id: Option<String>,
    pub role: MessageRole,
    pub body: String,
    pub metadata: Option<Value>,
    pub delivery_status: DeliveryStatus,
    pub event_type: Option<String>,
    pub thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    fn cursor(&self) -> Cursor {
        Cursor {
            created_at_ms: self.created_at.timestamp_millis(),
            id: self.id.to_string(),
        }
    }
}

/// A message about to be inserted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub sender_id: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
    pub role: MessageRole,
    pub body: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl NewMessage {
    /// Broadcast message from `sender`.
    pub fn new(sender: impl Into<String>, role: MessageRole, body: impl Into<String>) -> Self {
        Self {
            session_id: None,
            sender_id: sender.into(),
            recipient_id: None,
            role,
            body: body.into(),
            metadata: None,
            event_type: None,
            thread_id: None,
        }
    }

    /// Address the message to one recipient.
    #[must_use]
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient.into());
        self
    }

    #[must_use]
    pub fn in_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread_id = Some(thread.into());
        self
    }

    #[must_use]
    pub const fn in_session(mut self, session: SessionId) -> Self {
        self.session_id = Some(session);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }
}

/// Outcome of a read acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkRead {
    /// The message moved to `read`.
    Marked(Message),
    /// The message was already `read`; nothing changed.
    AlreadyRead(Message),
}

impl MarkRead {
    #[must_use]
    pub const fn message(&self) -> &Message {
        match self {
            Self::Marked(m) | Self::AlreadyRead(m) => m,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    session_id: Option<String>,
    sender_id: String,
    recipient_id: Option<String>,
    role: String,
    body: String,
    metadata: Option<String>,
    delivery_status: String,
    event_type: Option<String>,
    thread_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn parse_uuid(column: &'static str, value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|_| StoreError::Corrupt {
        column,
        value: value.to_string(),
    })
}

pub(crate) fn from_millis(column: &'static str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        column,
        value: ms.to_string(),
    })
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid("id", &row.id)?,
            session_id: row
                .session_id
                .as_deref()
                .map(|s| parse_uuid("session_id", s))
                .transpose()?,
            sender_id: row.sender_id,
            recipient_id: row.recipient_id,
            role: row.role.parse()?,
            body: row.body,
            metadata: row.metadata.as_deref().map(serde_json::from_str).transpose()?,
            delivery_status: row.delivery_status.parse()?,
            event_type: row.event_type,
            thread_id: row.thread_id,
            created_at: from_millis("created_at", row.created_at)?,
            updated_at: from_millis("updated_at", row.updated_at)?,
        })
    }
}

/// `CASE` expression ranking the `delivery_status` column.
const STATUS_RANK: &str = "CASE delivery_status \
    WHEN 'pending' THEN 0 WHEN 'sent' THEN 1 WHEN 'delivered' THEN 2 WHEN 'read' THEN 3 END";

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn like_escape(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// Durable, queryable chat log.
#[derive(Debug, Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a message, assigning id and timestamps. The stored status is
    /// always `delivered`.
    ///
    /// # Errors
    /// Returns `Persistence` if the write fails.
    pub async fn insert(&self, new: NewMessage) -> Result<Message, StoreError> {
        self.insert_at(new, Utc::now()).await
    }

    pub(crate) async fn insert_at(
        &self,
        new: NewMessage,
        now: DateTime<Utc>,
    ) -> Result<Message, StoreError> {
        let message = Message {
            id: Uuid::new_v4(),
            session_id: new.session_id,
            sender_id: new.sender_id,
            recipient_id: new.recipient_id,
            role: new.role,
            body: new.body,
            metadata: new.metadata,
            delivery_status: DeliveryStatus::Delivered,
            event_type: new.event_type,
            thread_id: new.thread_id,
            created_at: now,
            updated_at: now,
        };

        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r"INSERT INTO messages (
                id, session_id, sender_id, recipient_id, role, body, metadata,
                delivery_status, event_type, thread_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(message.session_id.map(|s| s.to_string()))
        .bind(&message.sender_id)
        .bind(&message.recipient_id)
        .bind(message.role.as_str())
        .bind(&message.body)
        .bind(metadata)
        .bind(message.delivery_status.as_str())
        .bind(&message.event_type)
        .bind(&message.thread_id)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            message_id = %message.id,
            sender = %message.sender_id,
            recipient = ?message.recipient_id,
            "Stored message"
        );
        Ok(message)
    }

    /// Fetch one message.
    ///
    /// # Errors
    /// Returns `Persistence` on I/O failure.
    pub async fn get(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(Message::try_from)
            .transpose()
    }

    /// Move a message forward to `to`. Returns `false` when the message is
    /// already at or past `to`; backward moves never happen.
    ///
    /// # Errors
    /// Returns `NotFound` if the message does not exist.
    pub async fn advance_status(&self, id: Uuid, to: DeliveryStatus) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE messages SET delivery_status = ?, updated_at = ? WHERE id = ? AND {STATUS_RANK} < ?"
        );
        let updated = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(id.to_string())
            .bind(to.rank())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 && self.get(id).await?.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(updated == 1)
    }

    /// Acknowledge a message as read. Idempotent.
    ///
    /// # Errors
    /// Returns `NotFound` if the message does not exist.
    pub async fn mark_read(&self, id: Uuid) -> Result<MarkRead, StoreError> {
        let changed = self.advance_status(id, DeliveryStatus::Read).await?;
        let message = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(if changed {
            MarkRead::Marked(message)
        } else {
            MarkRead::AlreadyRead(message)
        })
    }

    /// Mark every unread message from `agent_id` as read. Returns how many
    /// messages changed.
    ///
    /// # Errors
    /// Returns `Persistence` on I/O failure.
    pub async fn mark_all_read(&self, agent_id: &str) -> Result<u64, StoreError> {
        let updated = sqlx::query(
            "UPDATE messages SET delivery_status = 'read', updated_at = ? \
             WHERE sender_id = ? AND role <> 'user' AND delivery_status <> 'read'",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(agent_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated)
    }

    /// Number of not-yet-read messages per sending agent. Overseer (`user`)
    /// messages are not counted.
    ///
    /// # Errors
    /// Returns `Persistence` on I/O failure.
    pub async fn unread_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT sender_id, COUNT(*) FROM messages \
             WHERE delivery_status <> 'read' AND role <> 'user' \
             GROUP BY sender_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(agent, count)| (agent, u64::try_from(count).unwrap_or_default()))
            .collect())
    }

    /// Messages in a thread, newest first.
    ///
    /// # Errors
    /// Returns `InvalidCursor` or `Persistence`.
    pub async fn list_by_thread(
        &self,
        thread_id: &str,
        page: &PageRequest,
    ) -> Result<Page<Message>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM messages WHERE thread_id = ");
        qb.push_bind(thread_id.to_string());
        self.fetch_page(qb, page).await
    }

    /// Messages sent by or addressed to an agent, newest first.
    ///
    /// # Errors
    /// Returns `InvalidCursor` or `Persistence`.
    pub async fn list_by_agent(
        &self,
        agent_id: &str,
        page: &PageRequest,
    ) -> Result<Page<Message>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM messages WHERE (sender_id = ");
        qb.push_bind(agent_id.to_string())
            .push(" OR recipient_id = ")
            .push_bind(agent_id.to_string())
            .push(")");
        self.fetch_page(qb, page).await
    }

    /// Messages tied to one agent session, newest first.
    ///
    /// # Errors
    /// Returns `InvalidCursor` or `Persistence`.
    pub async fn list_by_session(
        &self,
        session_id: SessionId,
        page: &PageRequest,
    ) -> Result<Page<Message>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM messages WHERE session_id = ");
        qb.push_bind(session_id.to_string());
        self.fetch_page(qb, page).await
    }

    /// All messages, newest first.
    ///
    /// # Errors
    /// Returns `InvalidCursor` or `Persistence`.
    pub async fn list_recent(&self, page: &PageRequest) -> Result<Page<Message>, StoreError> {
        let qb = QueryBuilder::<Sqlite>::new("SELECT * FROM messages WHERE 1 = 1");
        self.fetch_page(qb, page).await
    }

    async fn fetch_page(
        &self,
        mut qb: QueryBuilder<'_, Sqlite>,
        page: &PageRequest,
    ) -> Result<Page<Message>, StoreError> {
        let limit = page.limit();
        if let Some(cursor) = page.cursor()? {
            qb.push(" AND (created_at < ")
                .push_bind(cursor.created_at_ms)
                .push(" OR (created_at = ")
                .push_bind(cursor.created_at_ms)
                .push(" AND id < ")
                .push_bind(cursor.id)
                .push("))");
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(limit) + 1);

        let rows = qb.build_query_as::<MessageRow>().fetch_all(&self.pool).await?;
        let messages = rows
            .into_iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_overfetch(messages, limit, Message::cursor))
    }

    /// Case-insensitive search over message bodies. Every whitespace
    /// separated term must appear. Newest first.
    ///
    /// # Errors
    /// Returns `Persistence` on I/O failure.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<Message>, StoreError> {
        let terms: Vec<&str> = query.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM messages WHERE 1 = 1");
        for term in terms {
            qb.push(" AND body LIKE ")
                .push_bind(like_escape(term))
                .push(" ESCAPE '\\'");
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(limit.clamp(1, crate::page::MAX_LIMIT)));

        qb.build_query_as::<MessageRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Message::try_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::Database;

    async fn store() -> MessageStore {
        Database::in_memory().await.unwrap().messages()
    }

    #[tokio::test]
    async fn insert_rests_at_delivered_and_mark_read_is_idempotent() {
        let store = store().await;
        let msg = store
            .insert(NewMessage::new("a1", MessageRole::Agent, "hi").to("a2"))
            .await
            .unwrap();
        assert_eq!(msg.delivery_status, DeliveryStatus::Delivered);

        let stored = store.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.delivery_status, DeliveryStatus::Delivered);
        assert_eq!(stored.recipient_id.as_deref(), Some("a2"));

        let first = store.mark_read(msg.id).await.unwrap();
        assert!(matches!(first, MarkRead::Marked(_)));
        assert_eq!(first.message().delivery_status, DeliveryStatus::Read);

        let second = store.mark_read(msg.id).await.unwrap();
        assert!(matches!(second, MarkRead::AlreadyRead(_)));
        assert_eq!(second.message().delivery_status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn status_never_moves_backward() {
        let store = store().await;
        let msg = store
            .insert(NewMessage::new("a1", MessageRole::Agent, "x"))
            .await
            .unwrap();

        assert!(!store.advance_status(msg.id, DeliveryStatus::Sent).await.unwrap());
        assert!(store.advance_status(msg.id, DeliveryStatus::Read).await.unwrap());
        assert!(!store.advance_status(msg.id, DeliveryStatus::Delivered).await.unwrap());
        assert!(!store.advance_status(msg.id, DeliveryStatus::Pending).await.unwrap());

        let stored = store.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.delivery_status, DeliveryStatus::Read);

        assert!(DeliveryStatus::Delivered.can_advance_to(DeliveryStatus::Read));
        assert!(!DeliveryStatus::Read.can_advance_to(DeliveryStatus::Delivered));
    }

    #[tokio::test]
    async fn mark_read_on_missing_message_is_not_found() {
        let store = store().await;
        let err = store.mark_read(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn unread_counts_group_by_agent_and_skip_overseer() {
        let store = store().await;
        store.insert(NewMessage::new("a1", MessageRole::Agent, "1")).await.unwrap();
        store.insert(NewMessage::new("a1", MessageRole::Agent, "2")).await.unwrap();
        let read = store.insert(NewMessage::new("a2", MessageRole::Agent, "3")).await.unwrap();
        store.insert(NewMessage::new("a2", MessageRole::Agent, "4")).await.unwrap();
        store.insert(NewMessage::new("overseer", MessageRole::User, "5")).await.unwrap();
        store.mark_read(read.id).await.unwrap();

        let counts = store.unread_counts().await.unwrap();
        assert_eq!(counts.get("a1"), Some(&2));
        assert_eq!(counts.get("a2"), Some(&1));
        assert_eq!(counts.get("overseer"), None);

        assert_eq!(store.mark_all_read("a1").await.unwrap(), 2);
        assert_eq!(store.mark_all_read("a1").await.unwrap(), 0);
        assert_eq!(store.unread_counts().await.unwrap().get("a1"), None);
    }

    #[tokio::test]
    async fn thread_pages_are_newest_first_and_disjoint() {
        let store = store().await;
        let base = Utc::now();
        for i in 0..5 {
            store
                .insert_at(
                    NewMessage::new("a1", MessageRole::Agent, format!("m{i}")).in_thread("t"),
                    base + Duration::seconds(i),
                )
                .await
                .unwrap();
        }
        store
            .insert(NewMessage::new("a1", MessageRole::Agent, "other").in_thread("u"))
            .await
            .unwrap();

        let first = store.list_by_thread("t", &PageRequest::first(2)).await.unwrap();
        let bodies: Vec<_> = first.items.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["m4", "m3"]);

        let second = store
            .list_by_thread("t", &PageRequest::after(first.next_cursor.unwrap(), 2))
            .await
            .unwrap();
        let bodies: Vec<_> = second.items.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["m2", "m1"]);

        let last = store
            .list_by_thread("t", &PageRequest::after(second.next_cursor.unwrap(), 2))
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(last.next_cursor.is_none());
    }

    #[tokio::test]
    async fn list_by_agent_includes_both_directions() {
        let store = store().await;
        store.insert(NewMessage::new("a1", MessageRole::Agent, "out")).await.unwrap();
        store
            .insert(NewMessage::new("overseer", MessageRole::User, "in").to("a1"))
            .await
            .unwrap();
        store.insert(NewMessage::new("a2", MessageRole::Agent, "unrelated")).await.unwrap();

        let page = store.list_by_agent("a1", &PageRequest::default()).await.unwrap();
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn invalid_cursor_is_rejected() {
        let store = store().await;
        let err = store
            .list_by_agent("a1", &PageRequest::after("not a cursor!", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn search_matches_all_terms_and_escapes_wildcards() {
        let store = store().await;
        store
            .insert(NewMessage::new("a1", MessageRole::Agent, "Build FAILED on main"))
            .await
            .unwrap();
        store
            .insert(NewMessage::new("a1", MessageRole::Agent, "build passed"))
            .await
            .unwrap();
        store
            .insert(NewMessage::new("a1", MessageRole::Agent, "coverage 100% done"))
            .await
            .unwrap();

        assert_eq!(store.search("build", 10).await.unwrap().len(), 2);
        let failed = store.search("build failed", 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].body, "Build FAILED on main");

        assert_eq!(store.search("100%", 10).await.unwrap().len(), 1);
        assert_eq!(store.search("%", 10).await.unwrap().len(), 1);
        assert!(store.search("_", 10).await.unwrap().is_empty());
        assert!(store.search("   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn metadata_survives_storage() {
        let store = store().await;
        let session = Uuid::new_v4();
        let msg = store
            .insert(
                NewMessage::new("a1", MessageRole::System, "spawned")
                    .in_session(session)
                    .with_metadata(serde_json::json!({"pane": "%1"}))
                    .with_event_type("session_started"),
            )
            .await
            .unwrap();

        let stored = store.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.metadata, Some(serde_json::json!({"pane": "%1"})));
        assert_eq!(stored.session_id, Some(session));
        assert_eq!(stored.event_type.as_deref(), Some("session_started"));

        let page = store.list_by_session(session, &PageRequest::default()).await.unwrap();
        assert_eq!(page.items.len(), 1);
    }
}
