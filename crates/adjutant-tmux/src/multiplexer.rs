//! The terminal-multiplexer seam.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Result of probing one backing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Session exists and at least one pane is running.
    Running,
    /// Session exists but every pane process has exited.
    PaneDead,
    /// No such session.
    Missing,
}

/// One session as reported by the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingSession {
    pub name: String,
    pub probe: Probe,
}

/// Parameters for creating a backing session.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    /// Session name; must be unused.
    pub name: String,
    pub working_dir: PathBuf,
    /// Program and arguments to run in the first pane. `None` runs the
    /// default shell.
    pub command: Option<Vec<String>>,
    /// Extra environment for the pane.
    pub env: Vec<(String, String)>,
}

/// Identifiers of a freshly created session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub session: String,
    pub pane_id: String,
}

/// Live output of one backing session.
///
/// Chunks arrive on `chunks` until the session ends or the pipe is dropped.
/// Dropping the pipe stops the underlying process.
pub struct OutputPipe {
    pub chunks: mpsc::Receiver<Bytes>,
    _stop: oneshot::Sender<()>,
}

impl OutputPipe {
    /// Create a pipe and the handles its producer needs.
    ///
    /// The producer should push into the sender and watch the receiver:
    /// it resolves when the pipe is dropped.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Sender<Bytes>, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = oneshot::channel();
        (
            Self {
                chunks: rx,
                _stop: stop_tx,
            },
            tx,
            stop_rx,
        )
    }
}

impl std::fmt::Debug for OutputPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPipe").finish_non_exhaustive()
    }
}

/// Multiplexer error.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("tmux executable not found")]
    NotInstalled,
    #[error("session already exists: {0}")]
    DuplicateSession(String),
    #[error("no such session: {0}")]
    NoSuchSession(String),
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("unexpected output: {0}")]
    Parse(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for terminal multiplexers hosting agent sessions.
///
/// Sessions live outside this process and can disappear at any time, so
/// every call is a fresh question to the multiplexer.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// List all sessions the multiplexer currently hosts.
    async fn list_sessions(&self) -> Result<Vec<BackingSession>, MuxError>;

    /// Probe one session.
    async fn probe(&self, name: &str) -> Result<Probe, MuxError>;

    /// Create a detached session.
    async fn create(&self, spec: &CreateSpec) -> Result<PaneInfo, MuxError>;

    /// Kill a session. Killing a missing session is not an error.
    async fn kill(&self, name: &str) -> Result<(), MuxError>;

    /// Write raw bytes to the session's active pane.
    async fn send_keys(&self, name: &str, data: &[u8]) -> Result<(), MuxError>;

    /// Start streaming the session's output.
    async fn open_pipe(&self, name: &str) -> Result<OutputPipe, MuxError>;
}
