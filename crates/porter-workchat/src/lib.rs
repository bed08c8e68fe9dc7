//! Workchat (enterprise chat) channel adapter.
//!
//! Implements the [`ChannelAdapter`](porter_channels::ChannelAdapter)
//! surface for the workchat platform: callback signature verification,
//! JSON envelope parsing, and outbound REST sends with a cached access
//! token.

pub mod adapter;
pub mod client;
pub mod crypto;

pub use adapter::{WorkchatAdapter, WorkchatConfig};
pub use client::WorkchatClient;
