//! Platform-agnostic channel layer.
//!
//! Every IM platform hides behind one [`ChannelAdapter`] trait; the
//! [`ChannelRouter`] keeps the registry of configured adapters and is the
//! single entry point that takes a parsed inbound message, runs the agent
//! turn, and ships the response back through the originating adapter.

pub mod adapter;
pub mod error;
pub mod router;
pub mod types;
pub mod webchat;

pub use adapter::{ChannelAdapter, TurnHandler};
pub use error::ChannelError;
pub use router::{ChannelRouter, ChannelStatus};
pub use types::{
    ChannelUser, InboundMessage, MessageKind, PlatformOptions, RawCallback, SendReceipt,
};
pub use webchat::WebChatAdapter;
