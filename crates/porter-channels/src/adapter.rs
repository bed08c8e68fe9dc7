use async_trait::async_trait;
use tracing::warn;

use porter_core::types::UserId;

use crate::error::ChannelError;
use crate::types::{ChannelUser, InboundMessage, MessageKind, PlatformOptions, RawCallback, SendReceipt};

/// The agent turn a routed message runs through. Implemented by the
/// orchestrator; kept as a trait here so the channel layer stays free of
/// orchestration dependencies.
#[async_trait]
pub trait TurnHandler: Send + Sync {
    /// Process one inbound message and return the user-visible reply.
    async fn handle(&self, message: &InboundMessage) -> String;
}

/// Common interface implemented by every channel adapter (workchat,
/// webchat, …).
///
/// Implementations must be `Send + Sync` so they can be stored in a
/// [`ChannelRouter`](crate::router::ChannelRouter) and driven from
/// multiple Tokio tasks.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Stable lowercase tag, unique across registered adapters.
    fn channel(&self) -> &'static str;

    /// Whether every required environment variable is present.
    fn is_configured(&self) -> bool;

    /// Environment variables this channel needs, for configuration checks
    /// and startup error listings.
    fn required_env(&self) -> &'static [&'static str];

    /// One-time startup work (token fetch, connectivity probe). Called by
    /// the router after the configuration check passes.
    async fn initialize(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Platform-specific signature / nonce / timestamp validation. The
    /// router trusts any message that got past this.
    fn verify_signature(&self, raw: &RawCallback) -> bool;

    /// Callback-URL verification exchange: validate the signature and
    /// return the echo token in plaintext.
    fn verify_url(&self, raw: &RawCallback) -> Result<String, ChannelError>;

    /// Parse a verified callback into the unified message shape.
    fn parse(&self, raw: &RawCallback) -> Result<InboundMessage, ChannelError>;

    /// Deliver one outbound message.
    async fn send(
        &self,
        user_id: &UserId,
        content: &str,
        kind: MessageKind,
        opts: &PlatformOptions,
    ) -> Result<SendReceipt, ChannelError>;

    /// Fetch the platform's profile for a user.
    async fn get_user_info(&self, user_id: &UserId) -> Result<ChannelUser, ChannelError>;

    /// Batch delivery. Default: per-user fan-out; platforms with a real
    /// batch API override this.
    async fn send_batch(
        &self,
        user_ids: &[UserId],
        content: &str,
        kind: MessageKind,
        opts: &PlatformOptions,
    ) -> Vec<Result<SendReceipt, ChannelError>> {
        let mut results = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let result = self.send(user_id, content, kind, opts).await;
            if let Err(ref e) = result {
                warn!(channel = self.channel(), user_id = %user_id, error = %e, "batch send failed for user");
            }
            results.push(result);
        }
        results
    }

    /// Handle a platform event (user joined, mention, …). Returning
    /// `Some(text)` sends that text back to the event's origin.
    async fn handle_event(
        &self,
        _event: &serde_json::Value,
    ) -> Result<Option<String>, ChannelError> {
        Ok(None)
    }
}

/// Which of `required_env` are missing from the process environment.
pub fn missing_env(adapter: &dyn ChannelAdapter) -> Vec<String> {
    adapter
        .required_env()
        .iter()
        .filter(|name| std::env::var(name).map(|v| v.is_empty()).unwrap_or(true))
        .map(|name| name.to_string())
        .collect()
}
