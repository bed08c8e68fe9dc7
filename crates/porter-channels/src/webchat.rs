use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use uuid::Uuid;

use porter_core::types::UserId;

use crate::adapter::ChannelAdapter;
use crate::error::ChannelError;
use crate::types::{
    ChannelUser, InboundMessage, MessageKind, PlatformOptions, RawCallback, SendReceipt,
};

/// The web-UI channel.
///
/// Messages arrive as JSON over the gateway's own HTTP endpoint (already
/// authenticated by the transport), and replies land in a per-user outbox
/// the HTTP layer drains back into the response. No external credentials,
/// always configured.
#[derive(Default)]
pub struct WebChatAdapter {
    outbox: DashMap<String, Vec<String>>,
}

#[derive(Deserialize)]
struct WebChatPayload {
    user_id: String,
    content: String,
    message_id: Option<String>,
    username: Option<String>,
}

impl WebChatAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take (and clear) everything queued for a user.
    pub fn drain(&self, user_id: &UserId) -> Vec<String> {
        self.outbox
            .remove(user_id.as_str())
            .map(|(_, messages)| messages)
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChannelAdapter for WebChatAdapter {
    fn channel(&self) -> &'static str {
        "webchat"
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn required_env(&self) -> &'static [&'static str] {
        &[]
    }

    fn verify_signature(&self, _raw: &RawCallback) -> bool {
        // Transport-level auth; nothing platform-specific to verify.
        true
    }

    fn verify_url(&self, raw: &RawCallback) -> Result<String, ChannelError> {
        Ok(raw.param("echostr").unwrap_or_default().to_string())
    }

    fn parse(&self, raw: &RawCallback) -> Result<InboundMessage, ChannelError> {
        let payload: WebChatPayload = serde_json::from_str(&raw.body)
            .map_err(|e| ChannelError::Parse(format!("bad webchat payload: {e}")))?;
        if payload.content.trim().is_empty() {
            return Err(ChannelError::Parse("empty content".into()));
        }

        let mut user = ChannelUser::bare(UserId::from(payload.user_id), "webchat");
        user.username = payload.username;

        Ok(InboundMessage {
            message_id: payload
                .message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            user,
            content: payload.content,
            kind: MessageKind::Text,
            timestamp: Utc::now(),
            attachments: Vec::new(),
            metadata: serde_json::Value::Null,
            raw: serde_json::from_str(&raw.body).unwrap_or(serde_json::Value::Null),
        })
    }

    async fn send(
        &self,
        user_id: &UserId,
        content: &str,
        _kind: MessageKind,
        _opts: &PlatformOptions,
    ) -> Result<SendReceipt, ChannelError> {
        self.outbox
            .entry(user_id.as_str().to_string())
            .or_default()
            .push(content.to_string());
        Ok(SendReceipt::default())
    }

    async fn get_user_info(&self, user_id: &UserId) -> Result<ChannelUser, ChannelError> {
        Ok(ChannelUser::bare(user_id.clone(), "webchat"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fills_defaults() {
        let adapter = WebChatAdapter::new();
        let message = adapter
            .parse(&RawCallback {
                query: Default::default(),
                body: r#"{"user_id":"u1","content":"hello","username":"Ada"}"#.into(),
            })
            .unwrap();
        assert_eq!(message.user.user_id.as_str(), "u1");
        assert_eq!(message.user.username.as_deref(), Some("Ada"));
        assert!(!message.message_id.is_empty());
    }

    #[test]
    fn empty_content_is_a_validation_error() {
        let adapter = WebChatAdapter::new();
        let err = adapter
            .parse(&RawCallback {
                query: Default::default(),
                body: r#"{"user_id":"u1","content":"  "}"#.into(),
            })
            .unwrap_err();
        assert!(matches!(err, ChannelError::Parse(_)));
    }

    #[tokio::test]
    async fn batch_send_fans_out_per_user() {
        let adapter = WebChatAdapter::new();
        let users: Vec<UserId> = vec!["u1".into(), "u2".into(), "u3".into()];
        let results = adapter
            .send_batch(
                &users,
                "maintenance tonight",
                MessageKind::Text,
                &PlatformOptions::default(),
            )
            .await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(Result::is_ok));
        for user in &users {
            assert_eq!(adapter.drain(user), vec!["maintenance tonight"]);
        }
    }

    #[tokio::test]
    async fn outbox_roundtrip() {
        let adapter = WebChatAdapter::new();
        let user: UserId = "u1".into();
        adapter
            .send(&user, "first", MessageKind::Text, &PlatformOptions::default())
            .await
            .unwrap();
        adapter
            .send(&user, "second", MessageKind::Text, &PlatformOptions::default())
            .await
            .unwrap();
        assert_eq!(adapter.drain(&user), vec!["first", "second"]);
        assert!(adapter.drain(&user).is_empty());
    }
}
