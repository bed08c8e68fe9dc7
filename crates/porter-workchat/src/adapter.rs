use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use porter_channels::{
    ChannelAdapter, ChannelError, ChannelUser, InboundMessage, MessageKind, PlatformOptions,
    RawCallback, SendReceipt,
};
use porter_core::types::UserId;

use crate::client::{WorkchatClient, DEFAULT_BASE_URL};
use crate::crypto::verify_signature;

const REQUIRED_ENV: &[&str] = &[
    "WORKCHAT_CORP_ID",
    "WORKCHAT_CORP_SECRET",
    "WORKCHAT_AGENT_ID",
    "WORKCHAT_TOKEN",
];

/// Workchat credentials and endpoint, normally read from the environment.
#[derive(Debug, Clone, Default)]
pub struct WorkchatConfig {
    pub corp_id: String,
    pub corp_secret: String,
    pub agent_id: String,
    /// Callback verification token.
    pub token: String,
    pub base_url: String,
}

impl WorkchatConfig {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).unwrap_or_default();
        Self {
            corp_id: var("WORKCHAT_CORP_ID"),
            corp_secret: var("WORKCHAT_CORP_SECRET"),
            agent_id: var("WORKCHAT_AGENT_ID"),
            token: var("WORKCHAT_TOKEN"),
            base_url: {
                let url = var("WORKCHAT_BASE_URL");
                if url.is_empty() {
                    DEFAULT_BASE_URL.to_string()
                } else {
                    url
                }
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.corp_id.is_empty()
            && !self.corp_secret.is_empty()
            && !self.agent_id.is_empty()
            && !self.token.is_empty()
    }
}

/// The callback envelope POSTed by the platform.
#[derive(Debug, Deserialize)]
struct WorkchatEnvelope {
    msg_id: Option<String>,
    from_user: String,
    #[serde(default)]
    msg_type: String,
    #[serde(default)]
    content: String,
    create_time: Option<i64>,
    #[serde(default)]
    event: Option<serde_json::Value>,
}

/// Workchat channel adapter.
///
/// The REST client is built lazily on first use so a merely-registered but
/// idle adapter does not hold network resources.
pub struct WorkchatAdapter {
    config: WorkchatConfig,
    client: OnceLock<WorkchatClient>,
}

impl WorkchatAdapter {
    pub fn new() -> Self {
        Self::with_config(WorkchatConfig::from_env())
    }

    pub fn with_config(config: WorkchatConfig) -> Self {
        Self {
            config,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> &WorkchatClient {
        self.client.get_or_init(|| {
            WorkchatClient::new(
                self.config.base_url.clone(),
                self.config.corp_id.clone(),
                self.config.corp_secret.clone(),
                self.config.agent_id.clone(),
            )
        })
    }

    /// Upload a local file to the platform, returning the media id to pass
    /// via `media_id` in the send options.
    pub async fn upload_media(
        &self,
        media_type: &str,
        path: &std::path::Path,
    ) -> Result<String, ChannelError> {
        self.client().upload_media(media_type, path).await
    }
}

impl Default for WorkchatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelAdapter for WorkchatAdapter {
    fn channel(&self) -> &'static str {
        "workchat"
    }

    fn is_configured(&self) -> bool {
        self.config.is_complete()
    }

    fn required_env(&self) -> &'static [&'static str] {
        REQUIRED_ENV
    }

    async fn initialize(&self) -> Result<(), ChannelError> {
        info!(agent_id = %self.config.agent_id, "workchat adapter initialised");
        Ok(())
    }

    fn verify_signature(&self, raw: &RawCallback) -> bool {
        let (Some(signature), Some(timestamp), Some(nonce)) = (
            raw.param("msg_signature"),
            raw.param("timestamp"),
            raw.param("nonce"),
        ) else {
            return false;
        };
        // GET verification signs the echo token; POST signs the body.
        let payload = raw.param("echostr").unwrap_or(&raw.body);
        verify_signature(&self.config.token, timestamp, nonce, payload, signature)
    }

    fn verify_url(&self, raw: &RawCallback) -> Result<String, ChannelError> {
        if !self.verify_signature(raw) {
            return Err(ChannelError::AuthFailed(
                "callback verification signature mismatch".into(),
            ));
        }
        raw.param("echostr")
            .map(str::to_string)
            .ok_or_else(|| ChannelError::Parse("missing echostr".into()))
    }

    fn parse(&self, raw: &RawCallback) -> Result<InboundMessage, ChannelError> {
        let envelope: WorkchatEnvelope = serde_json::from_str(&raw.body)
            .map_err(|e| ChannelError::Parse(format!("bad workchat envelope: {e}")))?;

        let kind = match envelope.msg_type.as_str() {
            "" | "text" => MessageKind::Text,
            "image" => MessageKind::Image,
            "file" => MessageKind::File,
            "event" => MessageKind::Event,
            other => {
                return Err(ChannelError::Parse(format!(
                    "unsupported message type: {other}"
                )))
            }
        };

        let timestamp = envelope
            .create_time
            .and_then(|t| Utc.timestamp_opt(t, 0).single())
            .unwrap_or_else(Utc::now);

        Ok(InboundMessage {
            message_id: envelope
                .msg_id
                .unwrap_or_else(|| format!("wc-{}", timestamp.timestamp_millis())),
            user: ChannelUser::bare(UserId::from(envelope.from_user), "workchat"),
            content: envelope.content,
            kind,
            timestamp,
            attachments: Vec::new(),
            metadata: envelope.event.unwrap_or(serde_json::Value::Null),
            raw: serde_json::from_str(&raw.body).unwrap_or(serde_json::Value::Null),
        })
    }

    async fn send(
        &self,
        user_id: &UserId,
        content: &str,
        kind: MessageKind,
        opts: &PlatformOptions,
    ) -> Result<SendReceipt, ChannelError> {
        let client = self.client();
        let msgid = match kind {
            MessageKind::Text => client.send_text(user_id.as_str(), content).await?,
            MessageKind::Markdown => client.send_markdown(user_id.as_str(), content).await?,
            MessageKind::Image => {
                let media_id = opts.str_value("media_id").ok_or(ChannelError::SendFailed {
                    channel: "workchat".into(),
                    reason: "image send requires a media_id".into(),
                })?;
                client.send_image(user_id.as_str(), media_id).await?
            }
            MessageKind::File => {
                let media_id = opts.str_value("media_id").ok_or(ChannelError::SendFailed {
                    channel: "workchat".into(),
                    reason: "file send requires a media_id".into(),
                })?;
                client.send_file(user_id.as_str(), media_id).await?
            }
            MessageKind::Event => {
                return Err(ChannelError::SendFailed {
                    channel: "workchat".into(),
                    reason: "events cannot be sent outbound".into(),
                })
            }
        };
        Ok(SendReceipt {
            message_id: msgid,
            detail: serde_json::Value::Null,
        })
    }

    async fn get_user_info(&self, user_id: &UserId) -> Result<ChannelUser, ChannelError> {
        let profile = self.client().get_user(user_id.as_str()).await?;
        let mut user = ChannelUser::bare(user_id.clone(), "workchat");
        user.username = profile
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        user.email = profile
            .get("email")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        user.department = profile
            .get("department")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(user)
    }

    async fn handle_event(
        &self,
        event: &serde_json::Value,
    ) -> Result<Option<String>, ChannelError> {
        match event.get("event_type").and_then(|v| v.as_str()) {
            Some("subscribe") => Ok(Some(
                "Hi! Ask me anything about the knowledge base.".to_string(),
            )),
            other => {
                warn!(event_type = ?other, "unhandled workchat event");
                Ok(None)
            }
        }
    }
}
