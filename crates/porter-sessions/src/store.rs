use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::{debug, info, warn};

use porter_core::types::{SessionId, UserId};
use porter_storage::{CasOutcome, KvBackend};

use crate::error::{Result, SessionError};
use crate::types::{
    HistoryMessage, MessageSnapshot, Session, SessionQueryResult, SessionRole, SessionStatus,
    SessionSummary, ACTIVE_TTL_SECS,
};

/// How long the secondary user → session-ids index outlives its sessions.
const USER_INDEX_TTL_SECS: u64 = 30 * 86_400;

/// Default retry budget for summary updates (50 / 100 / 200 ms backoff).
pub const DEFAULT_CAS_RETRIES: u32 = 3;

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: UserId,
    pub role: SessionRole,
    pub original_question: String,
    pub related_user_id: Option<UserId>,
    pub domain: Option<String>,
}

/// Options for [`SessionStore::query_by_user`].
#[derive(Debug, Clone, Copy)]
pub struct SessionQueryOptions {
    pub include_expired: bool,
    /// Clamped to 10; larger values are not honoured.
    pub max_per_role: usize,
}

impl Default for SessionQueryOptions {
    fn default() -> Self {
        Self {
            include_expired: false,
            max_per_role: 10,
        }
    }
}

/// Outcome of a single compare-and-swap attempt.
#[derive(Debug)]
pub enum CasResult {
    Ok(Session),
    Conflict,
    Absent,
}

/// Fields applied to a session summary in one atomic update.
#[derive(Debug, Clone, Default)]
pub struct SummaryUpdate {
    pub new_message: Option<MessageSnapshot>,
    pub key_points: Vec<String>,
    pub status: Option<SessionStatus>,
    pub tags: Vec<String>,
}

/// Durable map of session records with dual indexes and per-record TTL.
///
/// Keys: `session:<session_id>` for records, `user_sessions:<user_id>` for
/// the secondary index, `session_history:<session_id>` for full history.
pub struct SessionStore {
    backend: Arc<dyn KvBackend>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub fn is_degraded(&self) -> bool {
        self.backend.is_degraded()
    }

    /// Create and persist a new ACTIVE session, indexing it under its user.
    pub async fn create(&self, new: NewSession) -> Result<Session> {
        let now = Utc::now();
        let session_id = SessionId::generate();
        let session = Session {
            full_context_key: format!("session_history:{session_id}"),
            session_id: session_id.clone(),
            user_id: new.user_id.clone(),
            role: new.role,
            status: SessionStatus::Active,
            summary: SessionSummary::new(new.original_question),
            related_user_id: new.related_user_id,
            domain: new.domain,
            created_at: now,
            last_active_at: now,
            expires_at: now + chrono::Duration::seconds(ACTIVE_TTL_SECS),
            message_count: 0,
            tags: Vec::new(),
        };

        self.backend
            .set(
                &record_key(&session.session_id),
                &serde_json::to_string(&session)?,
                StdDuration::from_secs(ACTIVE_TTL_SECS as u64),
            )
            .await?;
        self.backend
            .set_add(
                &index_key(&session.user_id),
                session.session_id.as_str(),
                StdDuration::from_secs(USER_INDEX_TTL_SECS),
            )
            .await?;

        info!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            role = ?session.role,
            "created session"
        );
        Ok(session)
    }

    /// Fetch a session. Expired records surface as `None`.
    pub async fn get(&self, session_id: &SessionId) -> Result<Option<Session>> {
        let Some(raw) = self.backend.get(&record_key(session_id)).await? else {
            return Ok(None);
        };
        let session: Session = serde_json::from_str(&raw)?;
        if session.is_expired_at(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// All live sessions for a user, split by identity and sorted by
    /// recency (ties: created_at desc, then session_id).
    ///
    /// Index members whose record has expired are skipped silently, as stale
    /// membership is expected between sweeps, never an error.
    pub async fn query_by_user(
        &self,
        user_id: &UserId,
        opts: SessionQueryOptions,
    ) -> Result<SessionQueryResult> {
        let ids = self.backend.set_members(&index_key(user_id)).await?;
        if ids.is_empty() {
            return Ok(SessionQueryResult::empty(user_id.clone()));
        }

        let now = Utc::now();
        let mut as_user = Vec::new();
        let mut as_expert = Vec::new();

        for id in ids {
            let Some(raw) = self.backend.get(&record_key(&SessionId(id))).await? else {
                continue;
            };
            let session: Session = match serde_json::from_str(&raw) {
                Ok(s) => s,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "skipping unreadable session record");
                    continue;
                }
            };
            if !opts.include_expired && session.is_expired_at(now) {
                continue;
            }
            if session.role.is_asker() {
                as_user.push(session);
            } else {
                as_expert.push(session);
            }
        }

        as_user.sort_by(recency_order);
        as_expert.sort_by(recency_order);

        let cap = opts.max_per_role.min(10);
        as_user.truncate(cap);
        as_expert.truncate(cap);

        let total_count = as_user.len() + as_expert.len();
        Ok(SessionQueryResult {
            user_id: user_id.clone(),
            as_user,
            as_expert,
            total_count,
        })
    }

    /// One compare-and-swap attempt against the caller's observed version.
    ///
    /// On success the stored record is the mutated copy with
    /// `summary.version = expected_version + 1`, activity timestamps
    /// bumped, and the TTL rewritten from the (possibly changed) status,
    /// including the RESOLVED 24-hour tightening, atomically with the
    /// state and summary write.
    pub async fn cas_update<F>(
        &self,
        session_id: &SessionId,
        expected_version: u64,
        mutate: F,
    ) -> Result<CasResult>
    where
        F: FnOnce(&mut Session),
    {
        let Some(mut session) = self.get(session_id).await? else {
            return Ok(CasResult::Absent);
        };
        if session.summary.version != expected_version {
            return Ok(CasResult::Conflict);
        }

        let previous_status = session.status;
        mutate(&mut session);

        let now = Utc::now();
        session.summary.version = expected_version + 1;
        session.summary.last_updated = now;
        session.last_active_at = now;
        session.rewrite_expiry(previous_status, now);

        let ttl = (session.expires_at - now)
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        let outcome = self
            .backend
            .cas(
                &record_key(session_id),
                expected_version,
                &serde_json::to_string(&session)?,
                ttl,
            )
            .await?;

        Ok(match outcome {
            CasOutcome::Ok => CasResult::Ok(session),
            CasOutcome::Conflict => CasResult::Conflict,
            CasOutcome::Absent => CasResult::Absent,
        })
    }

    /// Apply a [`SummaryUpdate`] with the standard retry policy.
    pub async fn update_summary(
        &self,
        session_id: &SessionId,
        update: SummaryUpdate,
    ) -> Result<Session> {
        self.update_summary_with_retries(session_id, update, DEFAULT_CAS_RETRIES)
            .await
    }

    /// Read-mutate-CAS loop: on conflict, re-read and retry with
    /// exponential backoff (50 ms, 100 ms, 200 ms, then capped).
    pub async fn update_summary_with_retries(
        &self,
        session_id: &SessionId,
        update: SummaryUpdate,
        max_retries: u32,
    ) -> Result<Session> {
        for attempt in 0..max_retries {
            let Some(current) = self.get(session_id).await? else {
                return Err(SessionError::NotFound {
                    id: session_id.to_string(),
                });
            };
            let expected = current.summary.version;
            let update = update.clone();

            let result = self
                .cas_update(session_id, expected, move |session| {
                    if let Some(snapshot) = update.new_message {
                        session.summary.latest_exchange = Some(snapshot);
                    }
                    session.summary.merge_key_points(&update.key_points);
                    session.message_count += 1;
                    for tag in update.tags {
                        if !session.tags.contains(&tag) {
                            session.tags.push(tag);
                        }
                    }
                    if let Some(status) = update.status {
                        session.status = status;
                    }
                })
                .await?;

            match result {
                CasResult::Ok(session) => {
                    debug!(
                        session_id = %session_id,
                        version = session.summary.version,
                        "summary updated"
                    );
                    return Ok(session);
                }
                CasResult::Absent => {
                    return Err(SessionError::NotFound {
                        id: session_id.to_string(),
                    });
                }
                CasResult::Conflict => {
                    warn!(
                        session_id = %session_id,
                        attempt = attempt + 1,
                        max_retries,
                        "version conflict, retrying"
                    );
                    if attempt + 1 < max_retries {
                        let backoff = 50u64 << attempt.min(2);
                        tokio::time::sleep(StdDuration::from_millis(backoff)).await;
                    }
                }
            }
        }

        Err(SessionError::ConflictExhausted {
            id: session_id.to_string(),
            attempts: max_retries,
        })
    }

    /// Append one message to the full per-session history.
    ///
    /// LPUSH-style: no version discipline needed, appends never conflict.
    pub async fn append_history(
        &self,
        session_id: &SessionId,
        message: &HistoryMessage,
    ) -> Result<()> {
        self.backend
            .list_push(
                &history_key(session_id),
                &serde_json::to_string(message)?,
                StdDuration::from_secs(ACTIVE_TTL_SECS as u64),
            )
            .await?;
        Ok(())
    }

    /// The most recent `limit` history messages, oldest first. Entries
    /// that fail to parse are dropped rather than failing the read.
    pub async fn read_history(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>> {
        let raw = self
            .backend
            .list_range(&history_key(session_id), limit)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

fn record_key(session_id: &SessionId) -> String {
    format!("session:{session_id}")
}

fn index_key(user_id: &UserId) -> String {
    format!("user_sessions:{user_id}")
}

fn history_key(session_id: &SessionId) -> String {
    format!("session_history:{session_id}")
}

/// `last_active_at` desc, then `created_at` desc, then id lexicographic.
fn recency_order(a: &Session, b: &Session) -> Ordering {
    b.last_active_at
        .cmp(&a.last_active_at)
        .then(b.created_at.cmp(&a.created_at))
        .then(a.session_id.cmp(&b.session_id))
}
