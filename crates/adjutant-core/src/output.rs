//! Broadcast + history buffer for live terminal output.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use bytes::Bytes;
use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default history size limit (256 KiB of terminal output).
const HISTORY_BYTES: usize = 256 * 1024;

/// Live-channel capacity before slow viewers start lagging.
const CHANNEL_CAPACITY: usize = 1024;

/// One item of terminal output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutput {
    /// Raw bytes written by the pane.
    Data(Bytes),
    /// The backing session went away; no more data follows.
    Ended,
}

impl TerminalOutput {
    fn approx_bytes(&self) -> usize {
        match self {
            Self::Data(b) => b.len(),
            Self::Ended => 1,
        }
    }
}

struct Inner {
    history: VecDeque<TerminalOutput>,
    total_bytes: usize,
}

/// Output buffer with broadcast and bounded history.
///
/// A viewer that attaches late first receives the retained history, then
/// switches to live updates without gaps or duplicates. Nothing here is
/// persisted; the buffer only exists to feed live viewers.
pub struct OutputBuffer {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<TerminalOutput>,
    limit: usize,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    /// Create a new buffer with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(HISTORY_BYTES)
    }

    /// Create a new buffer retaining at most `limit` bytes of history.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
            limit,
        }
    }

    /// Push an item to both live listeners and history.
    pub fn push(&self, item: TerminalOutput) {
        let bytes = item.approx_bytes();

        // Sending under the write lock keeps `history_plus_stream` exact.
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let _ = self.sender.send(item.clone());

        while inner.total_bytes.saturating_add(bytes) > self.limit {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.approx_bytes());
            } else {
                break;
            }
        }
        inner.history.push_back(item);
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Push a chunk of pane output.
    pub fn push_data(&self, data: impl Into<Bytes>) {
        self.push(TerminalOutput::Data(data.into()));
    }

    /// Push the end-of-session marker.
    pub fn push_ended(&self) {
        self.push(TerminalOutput::Ended);
    }

    /// Number of viewers currently subscribed to live output.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<TerminalOutput> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Bytes currently retained.
    #[must_use]
    pub fn retained_bytes(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .total_bytes
    }

    /// Stream that yields history first, then live updates, ending after
    /// `Ended`.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, TerminalOutput> {
        let (history, rx) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let history: Vec<TerminalOutput> = inner.history.iter().cloned().collect();
            (history, self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(item) => Some(item),
                Err(e) => {
                    tracing::debug!("terminal viewer lagged: {e}");
                    None
                }
            }
        });

        let mut ended = false;
        hist.chain(live)
            .take_while(move |item| {
                let keep = !ended;
                ended = matches!(item, TerminalOutput::Ended);
                future::ready(keep)
            })
            .boxed()
    }
}
