use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use porter_core::types::{AgentSessionId, SessionId, UserId};
use porter_storage::KvBackend;

use crate::error::Result;

/// Sliding lifetime of a resume mapping.
const MAPPING_TTL: Duration = Duration::from_secs(7 * 86_400);

/// Maps an external user to the agent runtime's canonical session id.
///
/// `agent_session_id` is `None` until the runtime's first terminal result
/// assigns one; later turns pass it back so the runtime resumes context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSessionMapping {
    pub user_id: UserId,
    pub internal_session_id: Option<SessionId>,
    pub agent_session_id: Option<AgentSessionId>,
    pub updated_at: DateTime<Utc>,
}

/// Store for user → agent-session resume tokens (`kb_session:<user_id>`).
///
/// Writes are last-write-wins: concurrent turns for one user all carry the
/// same fresh id from the runtime, so no version discipline is needed.
pub struct AgentSessionStore {
    backend: Arc<dyn KvBackend>,
}

impl AgentSessionStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    fn key(user_id: &UserId) -> String {
        format!("kb_session:{user_id}")
    }

    /// Current mapping for the user. Reading slides the TTL.
    pub async fn get(&self, user_id: &UserId) -> Result<Option<UserSessionMapping>> {
        let key = Self::key(user_id);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };
        self.backend.touch(&key, MAPPING_TTL).await?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Persist (or replace) the mapping for a user.
    pub async fn put(
        &self,
        user_id: &UserId,
        internal_session_id: Option<SessionId>,
        agent_session_id: Option<AgentSessionId>,
    ) -> Result<()> {
        let mapping = UserSessionMapping {
            user_id: user_id.clone(),
            internal_session_id,
            agent_session_id,
            updated_at: Utc::now(),
        };
        self.backend
            .set(
                &Self::key(user_id),
                &serde_json::to_string(&mapping)?,
                MAPPING_TTL,
            )
            .await?;
        debug!(user_id = %user_id, "agent session mapping written");
        Ok(())
    }

    /// Drop the mapping so the next turn starts a fresh agent conversation.
    pub async fn clear(&self, user_id: &UserId) -> Result<()> {
        self.backend.delete(&Self::key(user_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porter_storage::MemoryBackend;

    #[tokio::test]
    async fn first_turn_has_no_mapping() {
        let store = AgentSessionStore::new(Arc::new(MemoryBackend::new()));
        assert!(store.get(&"u1".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let store = AgentSessionStore::new(Arc::new(MemoryBackend::new()));
        let user: UserId = "u1".into();
        store
            .put(&user, None, Some("agent-abc".into()))
            .await
            .unwrap();

        let mapping = store.get(&user).await.unwrap().unwrap();
        assert_eq!(mapping.agent_session_id.unwrap().as_str(), "agent-abc");

        store.clear(&user).await.unwrap();
        assert!(store.get(&user).await.unwrap().is_none());
    }
}
