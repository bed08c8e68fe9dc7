use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use porter_core::config::ChannelMode;
use porter_core::types::UserId;

use crate::adapter::{missing_env, ChannelAdapter, TurnHandler};
use crate::error::ChannelError;
use crate::types::{InboundMessage, MessageKind, PlatformOptions, SendReceipt};

/// Reported state of one registered channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub channel: String,
    pub configured: bool,
    pub required_env: Vec<String>,
}

/// Registry of configured channel adapters.
///
/// Built once at startup: each available adapter is offered via
/// [`register`](ChannelRouter::register) with its operator-chosen mode, and
/// only configured ones make it into the map. Routing to an unregistered
/// channel is a hard error.
#[derive(Default)]
pub struct ChannelRouter {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an adapter for registration under `mode`.
    ///
    /// - `Disabled`: never registered.
    /// - `Auto`: registered iff fully configured; skipped quietly otherwise.
    /// - `Enabled`: must register; missing configuration is a startup
    ///   error carrying the structured list of absent variables.
    ///
    /// Returns whether the adapter was registered.
    pub async fn register(
        &mut self,
        adapter: Arc<dyn ChannelAdapter>,
        mode: ChannelMode,
    ) -> Result<bool, ChannelError> {
        let channel = adapter.channel().to_string();

        match mode {
            ChannelMode::Disabled => {
                info!(channel, "channel disabled by operator, skipping");
                return Ok(false);
            }
            ChannelMode::Auto if !adapter.is_configured() => {
                info!(
                    channel,
                    missing = ?missing_env(adapter.as_ref()),
                    "channel not configured, skipping"
                );
                return Ok(false);
            }
            ChannelMode::Enabled if !adapter.is_configured() => {
                return Err(ChannelError::NotConfigured {
                    channel,
                    missing: missing_env(adapter.as_ref()),
                });
            }
            _ => {}
        }

        adapter.initialize().await?;
        info!(channel, "registered channel adapter");
        self.adapters.insert(channel, adapter);
        Ok(true)
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(channel).cloned()
    }

    pub fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    /// State of every registered channel, sorted by tag.
    pub fn statuses(&self) -> Vec<ChannelStatus> {
        let mut statuses: Vec<ChannelStatus> = self
            .adapters
            .values()
            .map(|a| ChannelStatus {
                channel: a.channel().to_string(),
                configured: a.is_configured(),
                required_env: a.required_env().iter().map(|s| s.to_string()).collect(),
            })
            .collect();
        statuses.sort_by(|a, b| a.channel.cmp(&b.channel));
        statuses
    }

    /// Run the agent turn for a parsed message and ship the reply back via
    /// the originating adapter.
    ///
    /// A send failure surfaces as an error, but the orchestration work it
    /// follows is not undone; the turn's state changes stand.
    pub async fn route(
        &self,
        channel: &str,
        message: &InboundMessage,
        handler: &dyn TurnHandler,
    ) -> Result<String, ChannelError> {
        let adapter = self
            .get(channel)
            .ok_or_else(|| ChannelError::UnknownChannel(channel.to_string()))?;

        info!(channel, user_id = %message.user.user_id, "routing inbound message");
        let reply = handler.handle(message).await;

        if let Err(e) = adapter
            .send(
                &message.user.user_id,
                &reply,
                MessageKind::Text,
                &PlatformOptions::default(),
            )
            .await
        {
            error!(channel, user_id = %message.user.user_id, error = %e, "failed to deliver reply");
            return Err(e);
        }

        Ok(reply)
    }

    /// Deliver a message outside the turn flow (reminders, notifications).
    pub async fn deliver(
        &self,
        channel: &str,
        user_id: &UserId,
        content: &str,
        kind: MessageKind,
    ) -> Result<SendReceipt, ChannelError> {
        let adapter = self
            .get(channel)
            .ok_or_else(|| ChannelError::UnknownChannel(channel.to_string()))?;
        adapter
            .send(user_id, content, kind, &PlatformOptions::default())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webchat::WebChatAdapter;
    use async_trait::async_trait;

    struct EchoHandler;

    #[async_trait]
    impl TurnHandler for EchoHandler {
        async fn handle(&self, message: &InboundMessage) -> String {
            format!("echo: {}", message.content)
        }
    }

    #[tokio::test]
    async fn unknown_channel_is_a_hard_error() {
        let router = ChannelRouter::new();
        let err = router
            .deliver(
                "telex",
                &"u1".into(),
                "hello",
                MessageKind::Text,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownChannel(ref c) if c == "telex"));
    }

    #[tokio::test]
    async fn routes_through_handler_and_sends_reply() {
        let mut router = ChannelRouter::new();
        let webchat = Arc::new(WebChatAdapter::new());
        router
            .register(Arc::clone(&webchat) as Arc<dyn ChannelAdapter>, ChannelMode::Auto)
            .await
            .unwrap();

        let message = webchat
            .parse(&crate::types::RawCallback {
                query: Default::default(),
                body: r#"{"user_id":"u1","content":"hi"}"#.to_string(),
            })
            .unwrap();

        let reply = router.route("webchat", &message, &EchoHandler).await.unwrap();
        assert_eq!(reply, "echo: hi");
        assert_eq!(webchat.drain(&"u1".into()), vec!["echo: hi"]);
    }

    #[tokio::test]
    async fn disabled_mode_never_registers() {
        let mut router = ChannelRouter::new();
        let registered = router
            .register(Arc::new(WebChatAdapter::new()), ChannelMode::Disabled)
            .await
            .unwrap();
        assert!(!registered);
        assert!(router.active_channels().is_empty());
    }
}
