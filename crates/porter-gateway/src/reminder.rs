use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use porter_channels::MessageKind;

use crate::app::AppState;

/// How often the waiting-for-expert states are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Periodic sweep over pending expert mediations: nudge experts who still
/// owe an answer, and tell askers when the wait has timed out.
pub fn spawn_reminder_sweep(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep_once(&state).await;
        }
    });
}

async fn sweep_once(state: &AppState) {
    let waiting = match state.conv_state.scan_waiting().await {
        Ok(waiting) => waiting,
        Err(e) => {
            warn!(error = %e, "reminder sweep could not scan conversation states");
            return;
        }
    };
    if waiting.is_empty() {
        return;
    }
    info!(pending = waiting.len(), "reminder sweep running");

    let channel = match state.config.channels.run_mode.as_str() {
        "standalone" => "webchat",
        mode => mode,
    };
    let timeout = state.conv_state.timeout();

    for context in waiting {
        if context.is_timed_out(timeout) {
            // Surface the timeout to the asker instead of dropping it.
            let text = format!(
                "Your question{} has waited over 24 hours for an expert reply. \
                 Please re-ask if it is still open.",
                context
                    .user_question
                    .as_deref()
                    .map(|q| format!(" ({q})"))
                    .unwrap_or_default()
            );
            if let Err(e) = state
                .channels
                .deliver(channel, &context.user_id, &text, MessageKind::Text)
                .await
            {
                warn!(user_id = %context.user_id, error = %e, "timeout notice delivery failed");
            }
            if let Err(e) = state.conv_state.clear(&context.user_id).await {
                warn!(user_id = %context.user_id, error = %e, "failed to clear timed-out state");
            }
            continue;
        }

        let Some(ref expert) = context.expert_user_id else {
            continue;
        };
        let text = format!(
            "Reminder: a colleague is waiting on your answer{}.",
            context
                .user_question
                .as_deref()
                .map(|q| format!(" to \"{q}\""))
                .unwrap_or_default()
        );
        if let Err(e) = state
            .channels
            .deliver(channel, expert, &text, MessageKind::Text)
            .await
        {
            warn!(expert = %expert, error = %e, "expert reminder delivery failed");
        }
    }
}
