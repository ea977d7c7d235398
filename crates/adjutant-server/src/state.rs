//! Shared application state.

use std::{path::PathBuf, sync::Arc, time::Instant};

use adjutant_protocol::ProtocolSessionManager;
use adjutant_session::SessionBridge;
use adjutant_store::{EventStore, MessageStore};
use adjutant_transport::{ChatHub, StatusHub};

/// Everything the HTTP handlers reach for.
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<SessionBridge>,
    pub messages: MessageStore,
    pub events: EventStore,
    pub chat: Arc<ChatHub>,
    pub status: Arc<StatusHub>,
    pub protocol: Arc<ProtocolSessionManager>,
    /// Default project for sessions created without one.
    pub project_root: PathBuf,
    pub started_at: Instant,
}

impl AppState {
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
