//! Agent status channel.

use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use adjutant_core::{AgentStatus, SessionId, SessionStatus};
use async_trait::async_trait;
use axum::extract::ws::WebSocket;
use futures::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
    protocol::StatusFrame,
    router::{ChannelHandler, ChannelRequest},
    socket::{next_text, spawn_writer},
};

const CHANNEL_CAPACITY: usize = 256;

/// Last-known status per agent plus live updates.
pub struct StatusHub {
    statuses: RwLock<BTreeMap<String, AgentStatus>>,
    tx: broadcast::Sender<StatusFrame>,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHub {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            statuses: RwLock::new(BTreeMap::new()),
            tx,
        }
    }

    /// Record an agent's status and broadcast it.
    pub fn set(&self, status: AgentStatus) {
        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
        statuses.insert(status.agent_id.clone(), status.clone());
        // Sent under the lock so a concurrent subscriber sees it either in
        // its snapshot or on its receiver, never both or neither.
        let _ = self.tx.send(StatusFrame::Status { status });
    }

    /// Broadcast a session lifecycle change.
    pub fn session_changed(&self, session_id: SessionId, status: SessionStatus) {
        let _ = self.tx.send(StatusFrame::Session { session_id, status });
    }

    /// Every known status, ordered by agent id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AgentStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<AgentStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    /// Snapshot plus a receiver for everything after it.
    #[must_use]
    pub fn subscribe(&self) -> (Vec<AgentStatus>, broadcast::Receiver<StatusFrame>) {
        let statuses = self.statuses.read().unwrap_or_else(PoisonError::into_inner);
        let rx = self.tx.subscribe();
        (statuses.values().cloned().collect(), rx)
    }
}

#[async_trait]
impl ChannelHandler for StatusHub {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn serve(&self, socket: WebSocket, _request: ChannelRequest) {
        let (sink, mut stream) = socket.split();
        let (tx, writer) = spawn_writer::<StatusFrame>(sink);

        let (statuses, mut updates) = self.subscribe();
        let _ = tx.send(StatusFrame::Snapshot { statuses });

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(frame) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Status viewer lagging, resending snapshot");
                        let _ = tx.send(StatusFrame::Snapshot { statuses: self.snapshot() });
                    }
                    Err(RecvError::Closed) => break,
                },
                // Inbound frames carry nothing; only a close matters.
                inbound = next_text(&mut stream) => {
                    if inbound.is_none() {
                        break;
                    }
                }
            }
        }

        drop(tx);
        let _ = writer.await;
    }
}

#[cfg(test)]
mod tests {
    use adjutant_core::{AgentRole, AgentState};
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn status(agent: &str, state: AgentState) -> AgentStatus {
        AgentStatus {
            agent_id: agent.to_string(),
            role: AgentRole::Worker,
            state,
            detail: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn late_subscribers_get_the_last_status_per_agent() {
        let hub = StatusHub::new();
        hub.set(status("a1", AgentState::Working));
        hub.set(status("a1", AgentState::Done));
        hub.set(status("a2", AgentState::Blocked));

        let (snapshot, mut rx) = hub.subscribe();
        let states: Vec<_> = snapshot.iter().map(|s| (s.agent_id.as_str(), s.state)).collect();
        assert_eq!(states, [("a1", AgentState::Done), ("a2", AgentState::Blocked)]);

        hub.set(status("a3", AgentState::Idle));
        let StatusFrame::Status { status } = rx.recv().await.unwrap() else {
            panic!("expected a status frame");
        };
        assert_eq!(status.agent_id, "a3");
        assert_eq!(hub.get("a3").unwrap().state, AgentState::Idle);
    }

    #[tokio::test]
    async fn session_changes_are_broadcast() {
        let hub = StatusHub::new();
        let (_, mut rx) = hub.subscribe();
        let id = Uuid::new_v4();
        hub.session_changed(id, SessionStatus::Zombie);
        assert_eq!(
            rx.recv().await.unwrap(),
            StatusFrame::Session {
                session_id: id,
                status: SessionStatus::Zombie
            }
        );
    }
}
