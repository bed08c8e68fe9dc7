use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use porter_channels::ChannelError;

pub const DEFAULT_BASE_URL: &str = "https://open.workchat.cn";

/// Refresh the access token this long before the platform expires it.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Per-request timeout for platform calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport-level retries for sends (exponential backoff).
const SEND_RETRIES: u32 = 2;

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// REST client for the workchat platform API.
///
/// Fetches and caches the corp access token lazily, refreshing it with a
/// safety margin before expiry.
pub struct WorkchatClient {
    http: reqwest::Client,
    base_url: String,
    corp_id: String,
    corp_secret: String,
    agent_id: String,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    errcode: Option<i64>,
    errmsg: Option<String>,
    access_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    msgid: Option<String>,
    media_id: Option<String>,
    #[serde(flatten)]
    rest: serde_json::Value,
}

impl WorkchatClient {
    pub fn new(base_url: String, corp_id: String, corp_secret: String, agent_id: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            base_url,
            corp_id,
            corp_secret,
            agent_id,
            token: Mutex::new(None),
        }
    }

    /// Current access token, fetching a fresh one when the cache is empty
    /// or inside the expiry margin.
    pub async fn access_token(&self) -> Result<String, ChannelError> {
        let mut cached = self.token.lock().await;
        if let Some(ref token) = *cached {
            if token.expires_at - Utc::now() > chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS)
            {
                return Ok(token.value.clone());
            }
        }

        let url = format!(
            "{}/cgi-bin/gettoken?corpid={}&corpsecret={}",
            self.base_url, self.corp_id, self.corp_secret
        );
        let response: TokenResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?
            .json()
            .await
            .map_err(transport_error)?;

        if response.errcode.unwrap_or(0) != 0 {
            return Err(ChannelError::Api {
                status: 502,
                message: format!(
                    "token fetch failed ({}): {}",
                    response.errcode.unwrap_or(-1),
                    response.errmsg.unwrap_or_default()
                ),
            });
        }

        let value = response.access_token.ok_or(ChannelError::Api {
            status: 502,
            message: "token response missing access_token".into(),
        })?;
        let expires_in = response.expires_in.unwrap_or(7200);
        debug!(expires_in, "workchat access token refreshed");

        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
        });
        Ok(value)
    }

    pub async fn send_text(&self, to_user: &str, content: &str) -> Result<Option<String>, ChannelError> {
        self.send_message(to_user, json!({ "msgtype": "text", "text": { "content": content } }))
            .await
    }

    pub async fn send_markdown(
        &self,
        to_user: &str,
        content: &str,
    ) -> Result<Option<String>, ChannelError> {
        self.send_message(
            to_user,
            json!({ "msgtype": "markdown", "markdown": { "content": content } }),
        )
        .await
    }

    pub async fn send_image(
        &self,
        to_user: &str,
        media_id: &str,
    ) -> Result<Option<String>, ChannelError> {
        self.send_message(
            to_user,
            json!({ "msgtype": "image", "image": { "media_id": media_id } }),
        )
        .await
    }

    pub async fn send_file(
        &self,
        to_user: &str,
        media_id: &str,
    ) -> Result<Option<String>, ChannelError> {
        self.send_message(
            to_user,
            json!({ "msgtype": "file", "file": { "media_id": media_id } }),
        )
        .await
    }

    /// Upload a local file, returning the platform media id for later
    /// image/file sends.
    pub async fn upload_media(
        &self,
        media_type: &str,
        path: &Path,
    ) -> Result<String, ChannelError> {
        let token = self.access_token().await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        let bytes = tokio::fs::read(path).await.map_err(|e| ChannelError::SendFailed {
            channel: "workchat".into(),
            reason: format!("cannot read {}: {e}", path.display()),
        })?;

        let url = format!(
            "{}/cgi-bin/media/upload?access_token={}&type={}&filename={}",
            self.base_url, token, media_type, filename
        );
        let response: ApiResponse = self
            .http
            .post(&url)
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?
            .json()
            .await
            .map_err(transport_error)?;

        if response.errcode != 0 {
            return Err(ChannelError::Api {
                status: 502,
                message: format!("media upload failed ({}): {}", response.errcode, response.errmsg),
            });
        }
        response.media_id.ok_or(ChannelError::Api {
            status: 502,
            message: "upload response missing media_id".into(),
        })
    }

    /// Fetch a user's directory profile.
    pub async fn get_user(&self, user_id: &str) -> Result<serde_json::Value, ChannelError> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/cgi-bin/user/get?access_token={}&userid={}",
            self.base_url, token, user_id
        );
        let response: ApiResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?
            .json()
            .await
            .map_err(transport_error)?;

        if response.errcode != 0 {
            return Err(ChannelError::Api {
                status: 404,
                message: format!("user lookup failed ({}): {}", response.errcode, response.errmsg),
            });
        }
        Ok(response.rest)
    }

    async fn send_message(
        &self,
        to_user: &str,
        mut body: serde_json::Value,
    ) -> Result<Option<String>, ChannelError> {
        body["touser"] = json!(to_user);
        body["agentid"] = json!(self.agent_id);

        let mut delay = Duration::from_millis(200);
        let mut last_err = None;

        for attempt in 0..=SEND_RETRIES {
            match self.try_send(&body).await {
                Ok(msgid) => return Ok(msgid),
                // Platform-level rejections are final; only transport
                // failures are retried.
                Err(e @ ChannelError::Api { .. }) => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "workchat send failed");
                    last_err = Some(e);
                    if attempt < SEND_RETRIES {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(ChannelError::SendFailed {
            channel: "workchat".into(),
            reason: "send retries exhausted".into(),
        }))
    }

    async fn try_send(&self, body: &serde_json::Value) -> Result<Option<String>, ChannelError> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/cgi-bin/message/send?access_token={}",
            self.base_url, token
        );
        let response: ApiResponse = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?
            .json()
            .await
            .map_err(transport_error)?;

        if response.errcode != 0 {
            return Err(ChannelError::Api {
                status: 502,
                message: format!("send rejected ({}): {}", response.errcode, response.errmsg),
            });
        }
        Ok(response.msgid)
    }
}

fn transport_error(e: reqwest::Error) -> ChannelError {
    ChannelError::SendFailed {
        channel: "workchat".into(),
        reason: e.to_string(),
    }
}
