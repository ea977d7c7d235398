//! Persisted chat message and agent event stores.
//!
//! Provides:
//! - `Database` - SQLite pool + schema
//! - `MessageStore` - Chat messages with delivery state and threading
//! - `EventStore` - Append-only, age-pruned audit log
//! - `spawn_retention` - Periodic event pruning

pub mod db;
pub mod error;
pub mod events;
pub mod messages;
pub mod page;
pub mod retention;

pub use db::Database;
pub use error::StoreError;
pub use events::{Event, EventFilter, EventStore, NewEvent};
pub use messages::{DeliveryStatus, MarkRead, Message, MessageRole, MessageStore, NewMessage};
pub use page::{Cursor, Page, PageRequest};
pub use retention::{RetentionPolicy, spawn_retention};
