//! In-memory multiplexer for tests.

use std::{
    collections::HashMap,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::multiplexer::{BackingSession, CreateSpec, Multiplexer, MuxError, OutputPipe, PaneInfo, Probe};

#[derive(Default)]
struct FakeSession {
    pane_dead: bool,
    input: Vec<u8>,
    pipes: Vec<mpsc::Sender<Bytes>>,
}

/// Multiplexer whose sessions live in a map.
///
/// Tests drive the "external world" through `vanish`, `exit_pane`,
/// `emit` and `set_unreachable`.
#[derive(Default)]
pub struct FakeMultiplexer {
    sessions: Mutex<HashMap<String, FakeSession>>,
    unreachable: AtomicBool,
    next_pane: AtomicUsize,
    pipes_opened: AtomicUsize,
    creates: AtomicUsize,
}

impl FakeMultiplexer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, FakeSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<(), MuxError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(MuxError::Command {
                command: "fake".to_string(),
                stderr: "server unreachable".to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Add a session created outside the bridge.
    pub fn insert_external(&self, name: &str) {
        self.lock().insert(name.to_string(), FakeSession::default());
    }

    /// Make a session disappear as if tmux had been killed.
    pub fn vanish(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Mark a session's pane as exited.
    pub fn exit_pane(&self, name: &str) {
        if let Some(s) = self.lock().get_mut(name) {
            s.pane_dead = true;
        }
    }

    /// Make every call fail as if tmux could not be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Write output to every open pipe of a session.
    pub fn emit(&self, name: &str, data: &[u8]) {
        if let Some(s) = self.lock().get_mut(name) {
            s.pipes
                .retain(|tx| tx.try_send(Bytes::copy_from_slice(data)).is_ok());
        }
    }

    /// Whether a session exists.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Bytes written to a session so far.
    #[must_use]
    pub fn input_of(&self, name: &str) -> Vec<u8> {
        self.lock().get(name).map(|s| s.input.clone()).unwrap_or_default()
    }

    /// Pipes whose receiving side is still alive.
    #[must_use]
    pub fn live_pipes(&self, name: &str) -> usize {
        let mut sessions = self.lock();
        sessions.get_mut(name).map_or(0, |s| {
            s.pipes.retain(|tx| !tx.is_closed());
            s.pipes.len()
        })
    }

    /// Total pipes ever opened.
    #[must_use]
    pub fn pipes_opened(&self) -> usize {
        self.pipes_opened.load(Ordering::SeqCst)
    }

    /// Total successful creates.
    #[must_use]
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Multiplexer for FakeMultiplexer {
    async fn list_sessions(&self) -> Result<Vec<BackingSession>, MuxError> {
        self.check_reachable()?;
        let mut sessions: Vec<BackingSession> = self
            .lock()
            .iter()
            .map(|(name, s)| BackingSession {
                name: name.clone(),
                probe: if s.pane_dead { Probe::PaneDead } else { Probe::Running },
            })
            .collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sessions)
    }

    async fn probe(&self, name: &str) -> Result<Probe, MuxError> {
        self.check_reachable()?;
        Ok(match self.lock().get(name) {
            None => Probe::Missing,
            Some(s) if s.pane_dead => Probe::PaneDead,
            Some(_) => Probe::Running,
        })
    }

    async fn create(&self, spec: &CreateSpec) -> Result<PaneInfo, MuxError> {
        self.check_reachable()?;
        // Yield so concurrent creates interleave like real I/O would.
        tokio::task::yield_now().await;
        let mut sessions = self.lock();
        if sessions.contains_key(&spec.name) {
            return Err(MuxError::DuplicateSession(spec.name.clone()));
        }
        sessions.insert(spec.name.clone(), FakeSession::default());
        self.creates.fetch_add(1, Ordering::SeqCst);
        let pane = self.next_pane.fetch_add(1, Ordering::SeqCst);
        Ok(PaneInfo {
            session: spec.name.clone(),
            pane_id: format!("%{pane}"),
        })
    }

    async fn kill(&self, name: &str) -> Result<(), MuxError> {
        self.check_reachable()?;
        self.lock().remove(name);
        Ok(())
    }

    async fn send_keys(&self, name: &str, data: &[u8]) -> Result<(), MuxError> {
        self.check_reachable()?;
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| MuxError::NoSuchSession(name.to_string()))?;
        session.input.extend_from_slice(data);
        Ok(())
    }

    async fn open_pipe(&self, name: &str) -> Result<OutputPipe, MuxError> {
        self.check_reachable()?;
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| MuxError::NoSuchSession(name.to_string()))?;
        let (pipe, tx, _stop) = OutputPipe::channel(64);
        session.pipes.push(tx);
        self.pipes_opened.fetch_add(1, Ordering::SeqCst);
        Ok(pipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_a_pipe_closes_it() {
        let mux = FakeMultiplexer::new();
        mux.insert_external("s");
        let mut pipe = mux.open_pipe("s").await.unwrap();
        mux.emit("s", b"hi");
        assert_eq!(pipe.chunks.recv().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(mux.live_pipes("s"), 1);
        drop(pipe);
        assert_eq!(mux.live_pipes("s"), 0);
    }
}
