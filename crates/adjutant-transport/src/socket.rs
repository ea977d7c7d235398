//! Shared WebSocket plumbing for the channel handlers.

use axum::extract::ws::{Message, WebSocket};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{sync::mpsc, task::JoinHandle};

/// Spawn a task that serializes frames onto the socket.
///
/// The task closes the socket once every sender is dropped.
pub(crate) fn spawn_writer<T>(
    mut sink: SplitSink<WebSocket, Message>,
) -> (mpsc::UnboundedSender<T>, JoinHandle<()>)
where
    T: Serialize + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<T>();
    let task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize frame: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });
    (tx, task)
}

/// Next text payload, or `None` once the peer closed or errored.
pub(crate) async fn next_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => return Some(s),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("WebSocket error: {e}");
                return None;
            }
        }
    }
    None
}

/// Parse one client frame, describing the problem on failure.
pub(crate) fn parse_frame<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    serde_json::from_str(text).map_err(|e| format!("Invalid message: {e}"))
}
