//! Wire frames for the real-time channels.
//!
//! One JSON object per WebSocket text frame, tagged by `type`. Terminal
//! bytes travel base64-encoded.

use adjutant_core::{AgentStatus, SessionId, SessionStatus};
use adjutant_store::Message;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Chat frame from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChatClientFrame {
    /// Send a message.
    ChatMessage {
        #[serde(default)]
        to: Option<String>,
        body: String,
        #[serde(default)]
        thread_id: Option<String>,
        #[serde(default)]
        session_id: Option<SessionId>,
        #[serde(default)]
        metadata: Option<Value>,
    },
    /// The client is typing; `agent_id` overrides the connection identity.
    Typing {
        #[serde(default)]
        agent_id: Option<String>,
    },
    /// Acknowledge a message as read.
    Read { message_id: Uuid },
    Ping,
}

/// Chat frame from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChatServerFrame {
    /// A message was stored.
    ChatMessage { message: Message },
    /// Sent to the author once their message is stored.
    Delivered { message_id: Uuid },
    Typing { from: String },
    /// A message moved to `read`.
    Read { message_id: Uuid },
    Error { message: String },
    Pong,
}

/// Status channel frame. The channel is server-to-client only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StatusFrame {
    /// Every known agent status; first frame on every connection.
    Snapshot { statuses: Vec<AgentStatus> },
    Status { status: AgentStatus },
    /// A supervised session changed lifecycle state.
    Session {
        session_id: SessionId,
        status: SessionStatus,
    },
}

/// Terminal frame from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalClientFrame {
    /// Keystrokes (base64 encoded).
    Input { data: String },
    Ping,
}

impl TerminalClientFrame {
    /// Create an input frame from raw bytes.
    #[must_use]
    pub fn input(data: &[u8]) -> Self {
        Self::Input {
            data: BASE64.encode(data),
        }
    }

    /// Decode input data from base64.
    #[must_use]
    pub fn decode_input(&self) -> Option<Vec<u8>> {
        if let Self::Input { data } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }
}

/// Terminal frame from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TerminalServerFrame {
    /// Pane output (base64 encoded).
    Output { session_id: SessionId, data: String },
    /// The session is gone; the server closes the connection next.
    Ended { session_id: SessionId },
    Error { message: String },
    Pong,
}

impl TerminalServerFrame {
    /// Create an output frame from raw bytes.
    #[must_use]
    pub fn output(session_id: SessionId, data: &[u8]) -> Self {
        Self::Output {
            session_id,
            data: BASE64.encode(data),
        }
    }

    /// Decode output data from base64.
    #[cfg(test)]
    pub(crate) fn decode_output(&self) -> Option<Vec<u8>> {
        if let Self::Output { data, .. } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use adjutant_core::{AgentRole, AgentState};
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    #[test]
    fn chat_frames_use_camel_case_fields() {
        let frame: ChatClientFrame = serde_json::from_value(json!({
            "type": "chat_message",
            "to": "a2",
            "body": "hi",
            "threadId": "t1"
        }))
        .unwrap();
        assert_eq!(
            frame,
            ChatClientFrame::ChatMessage {
                to: Some("a2".to_string()),
                body: "hi".to_string(),
                thread_id: Some("t1".to_string()),
                session_id: None,
                metadata: None,
            }
        );

        let id = Uuid::new_v4();
        let delivered = serde_json::to_value(ChatServerFrame::Delivered { message_id: id }).unwrap();
        assert_eq!(delivered, json!({"type": "delivered", "messageId": id}));
    }

    #[test]
    fn unknown_frame_types_are_rejected() {
        assert!(serde_json::from_str::<ChatClientFrame>(r#"{"type":"shout"}"#).is_err());
        assert!(serde_json::from_str::<TerminalClientFrame>(r#"{"data":"aGk="}"#).is_err());
    }

    #[test]
    fn status_snapshot_shape() {
        let status = AgentStatus {
            agent_id: "gastown/polecats/nux".to_string(),
            role: AgentRole::Worker,
            state: AgentState::Working,
            detail: None,
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(StatusFrame::Snapshot {
            statuses: vec![status],
        })
        .unwrap();
        assert_eq!(value["type"], "snapshot");
        assert_eq!(value["statuses"][0]["agentId"], "gastown/polecats/nux");
        assert_eq!(value["statuses"][0]["state"], "working");
    }

    #[test]
    fn terminal_bytes_are_base64() {
        let input = TerminalClientFrame::input(b"ls\r");
        assert_eq!(serde_json::to_value(&input).unwrap(), json!({"type": "input", "data": "bHMN"}));
        assert_eq!(input.decode_input().unwrap(), b"ls\r");

        let id = Uuid::new_v4();
        let output = TerminalServerFrame::output(id, b"\x1b[1mhi");
        assert_eq!(output.decode_output().unwrap(), b"\x1b[1mhi");
        assert_eq!(serde_json::to_value(&output).unwrap()["sessionId"], json!(id));
        assert!(TerminalServerFrame::Pong.decode_output().is_none());
    }
}
