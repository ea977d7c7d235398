//! Append-only agent event log.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::{
    StoreError,
    messages::from_millis,
    page::{Cursor, Page, PageRequest},
};

/// Rows deleted per prune statement. Keeps each write short so appends
/// never wait behind a long delete.
const PRUNE_BATCH: i64 = 500;

/// An immutable record of an agent action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub event_type: String,
    pub agent_id: String,
    pub action: String,
    pub detail: Option<Value>,
    pub work_item_id: Option<String>,
    pub message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    fn cursor(&self) -> Cursor {
        Cursor {
            created_at_ms: self.created_at.timestamp_millis(),
            id: self.id.to_string(),
        }
    }
}

/// An event about to be appended.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub event_type: String,
    pub agent_id: String,
    pub action: String,
    #[serde(default)]
    pub detail: Option<Value>,
    #[serde(default)]
    pub work_item_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<Uuid>,
}

impl NewEvent {
    pub fn new(
        event_type: impl Into<String>,
        agent_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            agent_id: agent_id.into(),
            action: action.into(),
            detail: None,
            work_item_id: None,
            message_id: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    #[must_use]
    pub fn for_work_item(mut self, work_item: impl Into<String>) -> Self {
        self.work_item_id = Some(work_item.into());
        self
    }

    #[must_use]
    pub const fn for_message(mut self, message: Uuid) -> Self {
        self.message_id = Some(message);
        self
    }
}

/// Event query filter. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub agent_id: Option<String>,
    pub work_item_id: Option<String>,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    event_type: String,
    agent_id: String,
    action: String,
    detail: Option<String>,
    work_item_id: Option<String>,
    message_id: Option<String>,
    created_at: i64,
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            event_type: row.event_type,
            agent_id: row.agent_id,
            action: row.action,
            detail: row.detail.as_deref().map(serde_json::from_str).transpose()?,
            work_item_id: row.work_item_id,
            message_id: row
                .message_id
                .as_deref()
                .map(|m| {
                    Uuid::parse_str(m).map_err(|_| StoreError::Corrupt {
                        column: "message_id",
                        value: m.to_string(),
                    })
                })
                .transpose()?,
            created_at: from_millis("created_at", row.created_at)?,
        })
    }
}

/// Durable, pruned audit log.
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an event.
    ///
    /// # Errors
    /// Returns `Persistence` if the write fails.
    pub async fn append(&self, new: NewEvent) -> Result<Event, StoreError> {
        self.append_at(new, Utc::now()).await
    }

    pub(crate) async fn append_at(
        &self,
        new: NewEvent,
        at: DateTime<Utc>,
    ) -> Result<Event, StoreError> {
        let detail = new.detail.as_ref().map(serde_json::to_string).transpose()?;

        let id = sqlx::query(
            r"INSERT INTO events (
                event_type, agent_id, action, detail, work_item_id, message_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.event_type)
        .bind(&new.agent_id)
        .bind(&new.action)
        .bind(detail)
        .bind(&new.work_item_id)
        .bind(new.message_id.map(|m| m.to_string()))
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        tracing::debug!(
            event_id = id,
            event_type = %new.event_type,
            agent = %new.agent_id,
            action = %new.action,
            "Appended event"
        );

        Ok(Event {
            id,
            event_type: new.event_type,
            agent_id: new.agent_id,
            action: new.action,
            detail: new.detail,
            work_item_id: new.work_item_id,
            message_id: new.message_id,
            created_at: from_millis("created_at", at.timestamp_millis())?,
        })
    }

    /// Query events, newest first.
    ///
    /// # Errors
    /// Returns `InvalidCursor` or `Persistence`.
    pub async fn query(
        &self,
        filter: &EventFilter,
        page: &PageRequest,
    ) -> Result<Page<Event>, StoreError> {
        let limit = page.limit();
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM events WHERE 1 = 1");

        if let Some(event_type) = &filter.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(agent_id) = &filter.agent_id {
            qb.push(" AND agent_id = ").push_bind(agent_id.clone());
        }
        if let Some(work_item_id) = &filter.work_item_id {
            qb.push(" AND work_item_id = ").push_bind(work_item_id.clone());
        }
        if let Some(cursor) = page.cursor()? {
            let id: i64 = cursor
                .id
                .parse()
                .map_err(|_| StoreError::InvalidCursor(cursor.encode()))?;
            qb.push(" AND (created_at < ")
                .push_bind(cursor.created_at_ms)
                .push(" OR (created_at = ")
                .push_bind(cursor.created_at_ms)
                .push(" AND id < ")
                .push_bind(id)
                .push("))");
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(limit) + 1);

        let events = qb
            .build_query_as::<EventRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Event::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_overfetch(events, limit, Event::cursor))
    }

    /// Total number of stored events.
    ///
    /// # Errors
    /// Returns `Persistence` on I/O failure.
    pub async fn count(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Delete every event older than `days` days. Returns the number of
    /// events deleted.
    ///
    /// # Errors
    /// Returns `Persistence` if a batch fails; earlier batches stay deleted.
    pub async fn prune_older_than(&self, days: u32) -> Result<u64, StoreError> {
        self.prune_before(Utc::now() - Duration::days(i64::from(days)))
            .await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut total = 0;
        loop {
            let deleted = sqlx::query(
                "DELETE FROM events WHERE id IN \
                 (SELECT id FROM events WHERE created_at < ? ORDER BY id LIMIT ?)",
            )
            .bind(cutoff_ms)
            .bind(PRUNE_BATCH)
            .execute(&self.pool)
            .await?
            .rows_affected();

            total += deleted;
            if deleted < PRUNE_BATCH.unsigned_abs() {
                break;
            }
            tokio::task::yield_now().await;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::Database;

    async fn store() -> EventStore {
        Database::in_memory().await.unwrap().events()
    }

    async fn append_aged(store: &EventStore, days: i64, action: &str) {
        store
            .append_at(
                NewEvent::new("status", "a1", action),
                Utc::now() - Duration::days(days),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn prune_removes_only_events_past_the_cutoff() {
        let store = store().await;
        for days in [1, 6, 8, 10] {
            append_aged(&store, days, &format!("{days}d")).await;
        }

        assert_eq!(store.prune_older_than(7).await.unwrap(), 2);

        let remaining = store
            .query(&EventFilter::default(), &PageRequest::default())
            .await
            .unwrap();
        let actions: Vec<_> = remaining.items.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, ["1d", "6d"]);
    }

    #[tokio::test]
    async fn prune_is_idempotent() {
        let store = store().await;
        append_aged(&store, 30, "old").await;
        append_aged(&store, 0, "new").await;

        assert_eq!(store.prune_older_than(7).await.unwrap(), 1);
        assert_eq!(store.prune_older_than(7).await.unwrap(), 0);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn prune_crosses_batch_boundaries() {
        let store = store().await;
        for _ in 0..(PRUNE_BATCH + 7) {
            append_aged(&store, 9, "old").await;
        }
        append_aged(&store, 1, "new").await;

        let deleted = store.prune_older_than(7).await.unwrap();
        assert_eq!(deleted, PRUNE_BATCH.unsigned_abs() + 7);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_filters_and_paginates() {
        let store = store().await;
        let base = Utc::now();
        for i in 0..3 {
            store
                .append_at(
                    NewEvent::new("bead", "a1", format!("claimed-{i}")).for_work_item("gt-1"),
                    base + Duration::seconds(i),
                )
                .await
                .unwrap();
        }
        store
            .append(NewEvent::new("bead", "a2", "claimed").for_work_item("gt-2"))
            .await
            .unwrap();
        store
            .append(NewEvent::new("status", "a1", "working").with_detail(json!({"pct": 40})))
            .await
            .unwrap();

        let filter = EventFilter {
            work_item_id: Some("gt-1".to_string()),
            ..EventFilter::default()
        };
        let first = store.query(&filter, &PageRequest::first(2)).await.unwrap();
        let actions: Vec<_> = first.items.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, ["claimed-2", "claimed-1"]);

        let rest = store
            .query(&filter, &PageRequest::after(first.next_cursor.unwrap(), 2))
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(rest.next_cursor.is_none());

        let by_type = EventFilter {
            event_type: Some("status".to_string()),
            agent_id: Some("a1".to_string()),
            ..EventFilter::default()
        };
        let statuses = store.query(&by_type, &PageRequest::default()).await.unwrap();
        assert_eq!(statuses.items.len(), 1);
        assert_eq!(statuses.items[0].detail, Some(json!({"pct": 40})));
    }
}
