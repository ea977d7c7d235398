//! Terminal channel: live pane output and keystrokes for one session.

use std::sync::Arc;

use adjutant_core::{SessionId, TerminalOutput};
use adjutant_session::SessionBridge;
use async_trait::async_trait;
use axum::extract::ws::WebSocket;
use futures::StreamExt;
use uuid::Uuid;

use crate::{
    protocol::{TerminalClientFrame, TerminalServerFrame},
    router::{ChannelHandler, ChannelRequest},
    socket::{next_text, parse_frame, spawn_writer},
};

/// Streams a session's output buffer and forwards input to its pane.
///
/// Each connection is one viewer; the bridge keeps the output pipe running
/// while at least one is attached.
pub struct TerminalChannel {
    bridge: Arc<SessionBridge>,
}

impl TerminalChannel {
    #[must_use]
    pub const fn new(bridge: Arc<SessionBridge>) -> Self {
        Self { bridge }
    }

    /// Apply one client frame; returns the reply, if any.
    pub async fn handle(
        &self,
        session_id: SessionId,
        frame: TerminalClientFrame,
    ) -> Option<TerminalServerFrame> {
        match frame {
            TerminalClientFrame::Ping => Some(TerminalServerFrame::Pong),
            TerminalClientFrame::Input { .. } => {
                let Some(data) = frame.decode_input() else {
                    return Some(TerminalServerFrame::error("Input is not valid base64"));
                };
                match self.bridge.send_input(session_id, &data).await {
                    Ok(()) => None,
                    Err(e) => {
                        tracing::warn!(%session_id, error = %e, "Failed to forward input");
                        Some(TerminalServerFrame::error(e.to_string()))
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ChannelHandler for TerminalChannel {
    fn name(&self) -> &'static str {
        "terminal"
    }

    async fn serve(&self, socket: WebSocket, request: ChannelRequest) {
        let (sink, mut stream) = socket.split();
        let (tx, writer) = spawn_writer::<TerminalServerFrame>(sink);

        let Some(session_id) = request.param.as_deref().and_then(|p| Uuid::parse_str(p).ok()) else {
            let _ = tx.send(TerminalServerFrame::error("Invalid session id"));
            drop(tx);
            let _ = writer.await;
            return;
        };

        let viewer = Uuid::new_v4();
        let output = match self.bridge.attach_viewer(session_id, viewer).await {
            Ok(_) => self.bridge.output(session_id).await,
            Err(e) => Err(e),
        };
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(%session_id, error = %e, "Terminal attach refused");
                let _ = tx.send(TerminalServerFrame::error(e.to_string()));
                drop(tx);
                let _ = writer.await;
                return;
            }
        };
        tracing::debug!(%session_id, %viewer, "Terminal viewer attached");

        let mut items = output.history_plus_stream();
        let forward_tx = tx.clone();
        let mut forward = tokio::spawn(async move {
            while let Some(item) = items.next().await {
                let frame = match item {
                    TerminalOutput::Data(bytes) => TerminalServerFrame::output(session_id, &bytes),
                    TerminalOutput::Ended => TerminalServerFrame::Ended { session_id },
                };
                let ended = matches!(frame, TerminalServerFrame::Ended { .. });
                if forward_tx.send(frame).is_err() || ended {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                _ = &mut forward => break,
                inbound = next_text(&mut stream) => {
                    let Some(text) = inbound else { break };
                    let reply = match parse_frame::<TerminalClientFrame>(&text) {
                        Ok(frame) => self.handle(session_id, frame).await,
                        Err(message) => Some(TerminalServerFrame::Error { message }),
                    };
                    if let Some(reply) = reply {
                        let _ = tx.send(reply);
                    }
                }
            }
        }

        forward.abort();
        drop(tx);
        let _ = writer.await;
        if let Err(e) = self.bridge.detach_viewer(session_id, viewer).await {
            tracing::debug!(%session_id, error = %e, "Detach after close");
        }
        tracing::debug!(%session_id, %viewer, "Terminal viewer detached");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use adjutant_core::WorkspaceKind;
    use adjutant_session::{BridgeConfig, Registry};
    use adjutant_tmux::{Multiplexer, testing::FakeMultiplexer};

    use super::*;

    async fn channel() -> (TerminalChannel, Arc<FakeMultiplexer>, SessionId, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(FakeMultiplexer::new());
        let bridge = Arc::new(SessionBridge::new(
            Arc::clone(&mux) as Arc<dyn Multiplexer>,
            Registry::in_dir(dir.path()),
            BridgeConfig::default(),
        ));
        let id = bridge
            .create_session(Path::new("/srv/app"), None, WorkspaceKind::Shared)
            .await
            .unwrap()
            .id;
        (TerminalChannel::new(bridge), mux, id, dir)
    }

    #[tokio::test]
    async fn input_frames_reach_the_pane() {
        let (channel, mux, id, _dir) = channel().await;
        let reply = channel.handle(id, TerminalClientFrame::input(b"echo hi\r")).await;
        assert!(reply.is_none());
        assert_eq!(mux.input_of("adj-app"), b"echo hi\r");
    }

    #[tokio::test]
    async fn bad_input_is_reported_not_dropped() {
        let (channel, _mux, id, _dir) = channel().await;
        let garbage = TerminalClientFrame::Input {
            data: "%%%".to_string(),
        };
        assert!(matches!(
            channel.handle(id, garbage).await,
            Some(TerminalServerFrame::Error { .. })
        ));

        let unknown = channel
            .handle(Uuid::new_v4(), TerminalClientFrame::input(b"x"))
            .await;
        assert!(matches!(unknown, Some(TerminalServerFrame::Error { .. })));
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let (channel, _mux, id, _dir) = channel().await;
        assert_eq!(
            channel.handle(id, TerminalClientFrame::Ping).await,
            Some(TerminalServerFrame::Pong)
        );
    }
}
