//! Real-time transport for the agent fleet.
//!
//! Provides:
//! - `UpgradeRouter` - Owns the upgrade endpoint, hands each connection to one channel
//! - Wire frames (JSON, `type`-tagged, base64 terminal bytes)
//! - `ChatHub`, `StatusHub`, `TerminalChannel` - The channel handlers

pub mod chat;
pub mod protocol;
pub mod router;
mod socket;
pub mod status;
pub mod terminal;

pub use chat::ChatHub;
pub use protocol::{
    ChatClientFrame, ChatServerFrame, StatusFrame, TerminalClientFrame, TerminalServerFrame,
};
pub use router::{ChannelHandler, ChannelRequest, Dispatch, PathPredicate, UpgradeRouter};
pub use status::StatusHub;
pub use terminal::TerminalChannel;
