//! tmux driver for supervised agent terminal sessions.
//!
//! Provides:
//! - `Multiplexer` - The seam the session bridge talks to
//! - `TmuxMultiplexer` - Implementation that shells out to `tmux`
//! - Control-mode output decoding for live output pipes
//! - Executable resolution utilities

pub mod control;
pub mod multiplexer;
pub mod shell;
pub mod tmux;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use multiplexer::{BackingSession, CreateSpec, Multiplexer, MuxError, OutputPipe, PaneInfo, Probe};
pub use shell::resolve_executable_path;
pub use tmux::TmuxMultiplexer;
