use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use porter_channels::{ChannelAdapter, RawCallback};

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
    pub session_id: Option<String>,
    pub resolved: bool,
}

/// Standalone web chat: one synchronous turn per request.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, String)> {
    let raw = RawCallback {
        query: Default::default(),
        body: serde_json::to_string(&serde_json::json!({
            "user_id": request.user_id,
            "content": request.content,
            "message_id": request.message_id,
            "username": request.username,
        }))
        .unwrap_or_default(),
    };

    let message = state
        .webchat
        .parse(&raw)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let reply = state.orchestrator.handle_message(&message).await;

    Ok(Json(ChatResponse {
        reply: reply.text,
        session_id: reply.session_id.map(|id| id.to_string()),
        resolved: reply.resolved,
    }))
}
