use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use porter_core::types::UserId;

/// Kind of an inbound or outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Markdown,
    Image,
    File,
    Event,
}

/// The sender as the platform describes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelUser {
    pub user_id: UserId,
    /// Channel tag this identity belongs to (e.g. "workchat").
    pub channel: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub department: Option<String>,
}

impl ChannelUser {
    pub fn bare(user_id: UserId, channel: impl Into<String>) -> Self {
        Self {
            user_id,
            channel: channel.into(),
            username: None,
            email: None,
            department: None,
        }
    }
}

/// A platform callback before verification/parsing: the query parameters
/// (signature, timestamp, nonce, echo) plus the raw body.
#[derive(Debug, Clone, Default)]
pub struct RawCallback {
    pub query: HashMap<String, String>,
    pub body: String,
}

impl RawCallback {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// Unified cross-platform inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    pub user: ChannelUser,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Platform-specific payload, kept for fields the unified shape drops.
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Platform-specific send parameters (media ids, safety flags, …).
#[derive(Debug, Clone, Default)]
pub struct PlatformOptions(pub serde_json::Map<String, serde_json::Value>);

impl PlatformOptions {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }
}

/// What a successful send returned.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SendReceipt {
    pub message_id: Option<String>,
    #[serde(default)]
    pub detail: serde_json::Value,
}
