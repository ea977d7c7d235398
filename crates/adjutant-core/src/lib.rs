//! Core types for agent fleet coordination.
//!
//! This crate provides the fundamental building blocks:
//! - `AgentSession` - A supervised terminal session bound to one agent
//! - `AgentStatus` - Last reported status of an agent
//! - `Topology` - Pluggable role/address lookup
//! - `OutputBuffer` - Broadcast + history for live terminal output

pub mod output;
pub mod session;
pub mod status;
pub mod topology;

pub use output::{OutputBuffer, TerminalOutput};
pub use session::{AgentSession, SessionId, SessionStatus, ViewerId, WorkspaceKind};
pub use status::{AgentState, AgentStatus};
pub use topology::{AgentAddress, AgentRole, DefaultTopology, Topology};
