use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::app::AppState;

/// Operational snapshot: pool utilisation, channel registry, storage mode.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "pools": state.pools.stats(),
        "channels": state.channels.statuses(),
        "active_channels": state.channels.active_channels(),
        "storage_degraded": state.sessions.is_degraded(),
        "run_mode": state.config.channels.run_mode,
    }))
}
