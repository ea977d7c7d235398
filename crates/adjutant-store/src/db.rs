//! SQLite pool and schema.

use std::{str::FromStr, time::Duration};

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

use crate::{StoreError, events::EventStore, messages::MessageStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS messages (
        id              TEXT PRIMARY KEY NOT NULL,
        session_id      TEXT,
        sender_id       TEXT NOT NULL,
        recipient_id    TEXT,
        role            TEXT NOT NULL,
        body            TEXT NOT NULL,
        metadata        TEXT,
        delivery_status TEXT NOT NULL,
        event_type      TEXT,
        thread_id       TEXT,
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages (sender_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages (recipient_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages (thread_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_status ON messages (delivery_status)",
    r"CREATE TABLE IF NOT EXISTS events (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        event_type   TEXT NOT NULL,
        agent_id     TEXT NOT NULL,
        action       TEXT NOT NULL,
        detail       TEXT,
        work_item_id TEXT,
        message_id   TEXT,
        created_at   INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_type ON events (event_type, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_events_agent ON events (agent_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_events_work_item ON events (work_item_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_events_created ON events (created_at)",
];

/// Shared relational store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `url` and apply the schema.
    ///
    /// # Errors
    /// Returns error if the URL is invalid, the file cannot be opened, or the
    /// schema cannot be applied.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        tracing::info!(%url, "Database ready");
        Ok(db)
    }

    /// Private in-memory database, used by tests and ephemeral runs.
    ///
    /// # Errors
    /// Returns error if the schema cannot be applied.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A single connection that never idles out, or the data vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Message store backed by this database.
    #[must_use]
    pub fn messages(&self) -> MessageStore {
        MessageStore::new(self.pool.clone())
    }

    /// Event store backed by this database.
    #[must_use]
    pub fn events(&self) -> EventStore {
        EventStore::new(self.pool.clone())
    }
}
