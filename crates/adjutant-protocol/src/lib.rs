//! Tool-protocol sessions for agent processes.
//!
//! Provides:
//! - `ProtocolSessionManager` - Creates isolated sessions, wires tools in once
//! - `ToolRegistrar` - The strategy that installs tools on each new session
//! - `FleetTools` - Standard registrar over the message/event stores and hubs
//! - JSON-RPC 2.0 over HTTP at `/mcp`

pub mod error;
pub mod http;
pub mod jsonrpc;
pub mod manager;
pub mod session;
pub mod tools;

pub use error::ProtocolError;
pub use manager::{ProtocolSessionManager, ToolRegistrar};
pub use session::{ProtocolSession, ToolDefinition, ToolHandler};
pub use tools::{FleetTools, UnavailableWorkItems, WorkItemClient, WorkItemError};
