use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use tracing::{error, info};

use porter_channels::{ChannelAdapter, MessageKind, RawCallback};

use crate::app::AppState;

/// Callback-URL verification exchange (GET): validate the signature and
/// answer with the decrypted echo token in plaintext.
pub async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<String, (StatusCode, String)> {
    let adapter = state
        .channels
        .get(&channel)
        .ok_or((StatusCode::NOT_FOUND, format!("unknown channel: {channel}")))?;

    let raw = RawCallback {
        query,
        body: String::new(),
    };
    match adapter.verify_url(&raw) {
        Ok(echo) => {
            info!(channel = %channel, "callback URL verified");
            Ok(echo)
        }
        Err(e) => Err((StatusCode::UNAUTHORIZED, e.to_string())),
    }
}

/// Message receive (POST): verify, parse, acknowledge immediately, and run
/// the turn on a background task, since platform callbacks demand a fast ack.
pub async fn receive_handler(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Result<&'static str, (StatusCode, String)> {
    let adapter = state
        .channels
        .get(&channel)
        .ok_or((StatusCode::NOT_FOUND, format!("unknown channel: {channel}")))?;

    let raw = RawCallback { query, body };
    if !adapter.verify_signature(&raw) {
        return Err((
            StatusCode::UNAUTHORIZED,
            "signature verification failed".to_string(),
        ));
    }

    let message = adapter
        .parse(&raw)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    // Platform events are answered inline when the adapter wants to.
    if message.kind == MessageKind::Event {
        if let Ok(Some(reply)) = adapter.handle_event(&message.metadata).await {
            let _ = state
                .channels
                .deliver(&channel, &message.user.user_id, &reply, MessageKind::Text)
                .await;
        }
        return Ok("success");
    }

    tokio::spawn(async move {
        if let Err(e) = state
            .channels
            .route(&channel, &message, state.orchestrator.as_ref())
            .await
        {
            error!(channel = %channel, error = %e, "background turn failed to deliver");
        }
    });

    Ok("success")
}
