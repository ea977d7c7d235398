//! Chat channel: live message fan-out backed by the message store.

use std::sync::Arc;

use adjutant_core::{AgentRole, Topology};
use adjutant_store::{MarkRead, Message, MessageRole, MessageStore, NewMessage, StoreError};
use async_trait::async_trait;
use axum::extract::ws::WebSocket;
use futures::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::{
    protocol::{ChatClientFrame, ChatServerFrame},
    router::{ChannelHandler, ChannelRequest},
    socket::{next_text, parse_frame, spawn_writer},
};

const CHANNEL_CAPACITY: usize = 512;

/// Who is on the other end of a chat connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPeer {
    pub agent_id: String,
    pub role: MessageRole,
}

/// Chat channel state shared by every connection.
pub struct ChatHub {
    messages: MessageStore,
    topology: Arc<dyn Topology>,
    tx: broadcast::Sender<ChatServerFrame>,
}

impl ChatHub {
    #[must_use]
    pub fn new(messages: MessageStore, topology: Arc<dyn Topology>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            messages,
            topology,
            tx,
        }
    }

    /// Frames fanned out to every connection.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChatServerFrame> {
        self.tx.subscribe()
    }

    /// Number of live chat connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Identify a connection from its `agentId` query parameter.
    ///
    /// No id, or one naming an overseer, means the human user.
    #[must_use]
    pub fn peer(&self, agent_id: Option<&str>) -> ChatPeer {
        let Some(agent_id) = agent_id.filter(|a| !a.is_empty()) else {
            return ChatPeer {
                agent_id: "user".to_string(),
                role: MessageRole::User,
            };
        };
        let role = self
            .topology
            .parse_address(agent_id)
            .map_or_else(|| self.topology.normalize_role(agent_id), |a| a.role);
        ChatPeer {
            agent_id: agent_id.to_string(),
            role: if role == AgentRole::Overseer {
                MessageRole::User
            } else {
                MessageRole::Agent
            },
        }
    }

    /// Store a message and fan it out.
    ///
    /// The store marks it `delivered` on insert, so every live viewer gets
    /// it in the same step.
    ///
    /// # Errors
    /// Returns error if the message cannot be stored; nothing is sent then.
    pub async fn send(&self, new: NewMessage) -> Result<Message, StoreError> {
        let message = self.messages.insert(new).await?;
        self.publish(message.clone());
        Ok(message)
    }

    /// Fan out an already stored message.
    pub fn publish(&self, message: Message) {
        let _ = self.tx.send(ChatServerFrame::ChatMessage { message });
    }

    /// Tell every viewer a message was read.
    pub fn announce_read(&self, message_id: Uuid) {
        let _ = self.tx.send(ChatServerFrame::Read { message_id });
    }

    /// Apply one client frame. Returns the frames meant only for the sender;
    /// fan-out goes through the broadcast channel.
    pub async fn handle(&self, peer: &ChatPeer, frame: ChatClientFrame) -> Vec<ChatServerFrame> {
        match frame {
            ChatClientFrame::ChatMessage {
                to,
                body,
                thread_id,
                session_id,
                metadata,
            } => {
                let new = NewMessage {
                    session_id,
                    sender_id: peer.agent_id.clone(),
                    recipient_id: to,
                    role: peer.role,
                    body,
                    metadata,
                    event_type: None,
                    thread_id,
                };
                match self.send(new).await {
                    Ok(message) => vec![ChatServerFrame::Delivered {
                        message_id: message.id,
                    }],
                    Err(e) => {
                        tracing::error!(agent = %peer.agent_id, error = %e, "Failed to store chat message");
                        vec![error_frame(&e)]
                    }
                }
            }
            ChatClientFrame::Typing { agent_id } => {
                let from = agent_id.unwrap_or_else(|| peer.agent_id.clone());
                let _ = self.tx.send(ChatServerFrame::Typing { from });
                Vec::new()
            }
            ChatClientFrame::Read { message_id } => match self.messages.mark_read(message_id).await {
                Ok(MarkRead::Marked(_)) => {
                    self.announce_read(message_id);
                    Vec::new()
                }
                Ok(MarkRead::AlreadyRead(_)) => Vec::new(),
                Err(e) => vec![error_frame(&e)],
            },
            ChatClientFrame::Ping => vec![ChatServerFrame::Pong],
        }
    }
}

fn error_frame(e: &StoreError) -> ChatServerFrame {
    ChatServerFrame::Error {
        message: e.to_string(),
    }
}

#[async_trait]
impl ChannelHandler for ChatHub {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn serve(&self, socket: WebSocket, request: ChannelRequest) {
        let peer = self.peer(request.query.get("agentId").map(String::as_str));
        tracing::debug!(agent = %peer.agent_id, "Chat connection opened");

        let (sink, mut stream) = socket.split();
        let (tx, writer) = spawn_writer::<ChatServerFrame>(sink);

        let mut fanout = self.subscribe();
        let fanout_tx = tx.clone();
        let forward = tokio::spawn(async move {
            loop {
                match fanout.recv().await {
                    Ok(frame) => {
                        if fanout_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Chat viewer lagging, frames dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        while let Some(text) = next_text(&mut stream).await {
            let replies = match parse_frame::<ChatClientFrame>(&text) {
                Ok(frame) => self.handle(&peer, frame).await,
                Err(message) => {
                    tracing::warn!(agent = %peer.agent_id, "{message}");
                    vec![ChatServerFrame::Error { message }]
                }
            };
            for reply in replies {
                let _ = tx.send(reply);
            }
        }

        forward.abort();
        drop(tx);
        let _ = writer.await;
        tracing::debug!(agent = %peer.agent_id, "Chat connection closed");
    }
}

#[cfg(test)]
mod tests {
    use adjutant_core::DefaultTopology;
    use adjutant_store::{Database, DeliveryStatus};

    use super::*;

    async fn hub() -> ChatHub {
        let db = Database::in_memory().await.unwrap();
        ChatHub::new(db.messages(), Arc::new(DefaultTopology::new()))
    }

    #[tokio::test]
    async fn peers_are_identified_by_topology() {
        let hub = hub().await;
        assert_eq!(hub.peer(None).role, MessageRole::User);
        assert_eq!(hub.peer(Some("overseer")).role, MessageRole::User);
        assert_eq!(hub.peer(Some("mayor/")).role, MessageRole::Agent);

        let worker = hub.peer(Some("gastown/polecats/nux"));
        assert_eq!(worker.agent_id, "gastown/polecats/nux");
        assert_eq!(worker.role, MessageRole::Agent);
    }

    #[tokio::test]
    async fn sent_messages_are_delivered_and_fanned_out() {
        let hub = hub().await;
        let mut viewer = hub.subscribe();
        let peer = hub.peer(Some("a1"));

        let replies = hub
            .handle(
                &peer,
                ChatClientFrame::ChatMessage {
                    to: Some("a2".to_string()),
                    body: "hi".to_string(),
                    thread_id: None,
                    session_id: None,
                    metadata: None,
                },
            )
            .await;

        let ChatServerFrame::ChatMessage { message } = viewer.recv().await.unwrap() else {
            panic!("expected a chat message");
        };
        assert_eq!(message.sender_id, "a1");
        assert_eq!(message.recipient_id.as_deref(), Some("a2"));
        assert_eq!(message.delivery_status, DeliveryStatus::Delivered);
        assert_eq!(
            replies,
            [ChatServerFrame::Delivered {
                message_id: message.id
            }]
        );
    }

    #[tokio::test]
    async fn read_is_announced_once() {
        let hub = hub().await;
        let message = hub
            .send(NewMessage::new("a1", MessageRole::Agent, "hi").to("a2"))
            .await
            .unwrap();
        let mut viewer = hub.subscribe();
        let peer = hub.peer(Some("a2"));

        for _ in 0..2 {
            let replies = hub
                .handle(
                    &peer,
                    ChatClientFrame::Read {
                        message_id: message.id,
                    },
                )
                .await;
            assert!(replies.is_empty());
        }

        assert_eq!(
            viewer.recv().await.unwrap(),
            ChatServerFrame::Read {
                message_id: message.id
            }
        );
        assert!(viewer.try_recv().is_err());
    }

    #[tokio::test]
    async fn reading_an_unknown_message_reports_an_error() {
        let hub = hub().await;
        let peer = hub.peer(None);
        let replies = hub
            .handle(
                &peer,
                ChatClientFrame::Read {
                    message_id: Uuid::new_v4(),
                },
            )
            .await;
        assert!(matches!(replies.as_slice(), [ChatServerFrame::Error { .. }]));
    }

    #[tokio::test]
    async fn typing_and_ping() {
        let hub = hub().await;
        let mut viewer = hub.subscribe();
        let peer = hub.peer(Some("a1"));

        assert!(hub.handle(&peer, ChatClientFrame::Typing { agent_id: None }).await.is_empty());
        assert_eq!(
            viewer.recv().await.unwrap(),
            ChatServerFrame::Typing {
                from: "a1".to_string()
            }
        );
        assert_eq!(hub.handle(&peer, ChatClientFrame::Ping).await, [ChatServerFrame::Pong]);
    }
}
