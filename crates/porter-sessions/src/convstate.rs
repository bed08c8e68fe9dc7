use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use porter_core::types::UserId;
use porter_storage::KvBackend;

use crate::error::Result;

/// State of one outstanding expert-mediated question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    #[serde(rename = "waiting_expert")]
    WaitingForExpert,
    Completed,
}

/// Per-user single-slot record for expert mediation.
///
/// Transitions `IDLE → WAITING_FOR_EXPERT` when the orchestrator contacts
/// an expert, and `WAITING_FOR_EXPERT → COMPLETED` when the reply arrives.
/// The record carries an absolute 24-hour timeout from `contacted_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub user_id: UserId,
    pub state: ConversationState,
    pub user_question: Option<String>,
    pub domain: Option<String>,
    pub expert_user_id: Option<UserId>,
    pub expert_name: Option<String>,
    pub contacted_at: Option<DateTime<Utc>>,
    pub expert_reply: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationContext {
    pub fn idle(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            state: ConversationState::Idle,
            user_question: None,
            domain: None,
            expert_user_id: None,
            expert_name: None,
            contacted_at: None,
            expert_reply: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.state == ConversationState::WaitingForExpert
    }

    /// True when the expert was contacted more than `timeout` ago and no
    /// reply has been recorded. Timed-out records are surfaced, and callers
    /// decide how to tell the user; nothing is silently dropped.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        if !self.is_waiting() {
            return false;
        }
        match self.contacted_at {
            Some(at) => {
                let timeout =
                    chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
                Utc::now() - at > timeout
            }
            None => false,
        }
    }
}

/// Partial update applied to a [`ConversationContext`].
#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub state: Option<ConversationState>,
    pub user_question: Option<String>,
    pub domain: Option<String>,
    pub expert_user_id: Option<UserId>,
    pub expert_name: Option<String>,
    pub contacted_at: Option<DateTime<Utc>>,
    pub expert_reply: Option<String>,
}

/// Store for the expert-mediation state machine.
///
/// Keys are channel-prefixed (`<channel>:conv_state:<user_id>`) so several
/// platforms can coexist on one backend.
pub struct ConversationStateStore {
    backend: Arc<dyn KvBackend>,
    channel: String,
    ttl: Duration,
}

impl ConversationStateStore {
    pub fn new(backend: Arc<dyn KvBackend>, channel: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend,
            channel: channel.into(),
            ttl,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.ttl
    }

    fn key(&self, user_id: &UserId) -> String {
        format!("{}:conv_state:{}", self.channel, user_id)
    }

    fn prefix(&self) -> String {
        format!("{}:conv_state:", self.channel)
    }

    /// The user's current context, or a fresh IDLE one when absent.
    pub async fn get(&self, user_id: &UserId) -> Result<ConversationContext> {
        match self.backend.get(&self.key(user_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => {
                debug!(user_id = %user_id, "no conversation state, starting idle");
                Ok(ConversationContext::idle(user_id.clone()))
            }
        }
    }

    /// Apply a patch and persist the result with the store's TTL.
    pub async fn update(
        &self,
        user_id: &UserId,
        patch: ConversationPatch,
    ) -> Result<ConversationContext> {
        let mut context = self.get(user_id).await?;

        if let Some(state) = patch.state {
            context.state = state;
        }
        if let Some(q) = patch.user_question {
            context.user_question = Some(q);
        }
        if let Some(d) = patch.domain {
            context.domain = Some(d);
        }
        if let Some(e) = patch.expert_user_id {
            context.expert_user_id = Some(e);
        }
        if let Some(n) = patch.expert_name {
            context.expert_name = Some(n);
        }
        if let Some(at) = patch.contacted_at {
            context.contacted_at = Some(at);
        }
        if let Some(r) = patch.expert_reply {
            context.expert_reply = Some(r);
        }
        context.updated_at = Utc::now();

        self.backend
            .set(
                &self.key(user_id),
                &serde_json::to_string(&context)?,
                self.ttl,
            )
            .await?;
        info!(user_id = %user_id, state = ?context.state, "conversation state updated");
        Ok(context)
    }

    /// All contexts currently waiting for an expert, timed-out ones
    /// included. Driven by the periodic reminder task.
    pub async fn scan_waiting(&self) -> Result<Vec<ConversationContext>> {
        let keys = self.backend.scan_prefix(&self.prefix()).await?;
        let mut waiting = Vec::new();
        for key in keys {
            let Some(raw) = self.backend.get(&key).await? else {
                continue;
            };
            let context: ConversationContext = match serde_json::from_str(&raw) {
                Ok(c) => c,
                Err(_) => continue,
            };
            if context.is_waiting() {
                waiting.push(context);
            }
        }
        Ok(waiting)
    }

    /// The waiting context assigned to `expert_user_id`, if any. Used when
    /// an answer-shaped message arrives from a known expert.
    pub async fn find_pending_for_expert(
        &self,
        expert_user_id: &UserId,
    ) -> Result<Option<ConversationContext>> {
        let waiting = self.scan_waiting().await?;
        Ok(waiting
            .into_iter()
            .find(|c| c.expert_user_id.as_ref() == Some(expert_user_id)))
    }

    pub async fn clear(&self, user_id: &UserId) -> Result<()> {
        self.backend.delete(&self.key(user_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porter_storage::MemoryBackend;

    fn store() -> ConversationStateStore {
        ConversationStateStore::new(
            Arc::new(MemoryBackend::new()),
            "workchat",
            Duration::from_secs(86_400),
        )
    }

    #[tokio::test]
    async fn absent_user_starts_idle() {
        let s = store();
        let ctx = s.get(&"u1".into()).await.unwrap();
        assert_eq!(ctx.state, ConversationState::Idle);
    }

    #[tokio::test]
    async fn waiting_then_completed() {
        let s = store();
        let user: UserId = "u1".into();

        s.update(
            &user,
            ConversationPatch {
                state: Some(ConversationState::WaitingForExpert),
                user_question: Some("how do I adjust payroll?".into()),
                domain: Some("HR".into()),
                expert_user_id: Some("exp001".into()),
                expert_name: Some("Dana".into()),
                contacted_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let pending = s.find_pending_for_expert(&"exp001".into()).await.unwrap();
        assert_eq!(pending.unwrap().user_id, user);
        assert_eq!(s.scan_waiting().await.unwrap().len(), 1);

        s.update(
            &user,
            ConversationPatch {
                state: Some(ConversationState::Completed),
                expert_reply: Some("use the payroll portal".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(s.scan_waiting().await.unwrap().is_empty());
        assert!(s
            .find_pending_for_expert(&"exp001".into())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn timeout_is_surfaced_not_dropped() {
        let s = store();
        let user: UserId = "u1".into();
        s.update(
            &user,
            ConversationPatch {
                state: Some(ConversationState::WaitingForExpert),
                contacted_at: Some(Utc::now() - chrono::Duration::hours(25)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let ctx = s.get(&user).await.unwrap();
        assert!(ctx.is_timed_out(Duration::from_secs(86_400)));
        // Still visible to the sweep.
        assert_eq!(s.scan_waiting().await.unwrap().len(), 1);
    }
}
