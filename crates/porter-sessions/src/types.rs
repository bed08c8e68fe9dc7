use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use porter_core::types::{SessionId, UserId};

/// Oldest key points are evicted once a summary holds this many.
pub const KEY_POINTS_CAP: usize = 10;

/// TTL for sessions that are still being worked (ACTIVE / WAITING_EXPERT).
pub const ACTIVE_TTL_SECS: i64 = 7 * 86_400;

/// TTL tail once a session transitions to RESOLVED.
pub const RESOLVED_TTL_SECS: i64 = 24 * 3_600;

/// The user's role within one session. Frozen at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    /// Asking on their own behalf.
    User,
    /// Being consulted by another user.
    Expert,
    /// A registered expert asking on their own behalf.
    ExpertAsUser,
}

impl SessionRole {
    /// Whether sessions with this role land in the `as_user` candidate list.
    pub fn is_asker(&self) -> bool {
        matches!(self, SessionRole::User | SessionRole::ExpertAsUser)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    WaitingExpert,
    Resolved,
    Expired,
}

/// Who authored a summary snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotRole {
    User,
    Agent,
    Expert,
}

/// One message captured for the rolling summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub role: SnapshotRole,
}

/// The rolling session summary.
///
/// `original_question` never changes after creation; `version` is the
/// optimistic-lock counter, bumped by exactly one on each successful CAS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub original_question: String,
    pub latest_exchange: Option<MessageSnapshot>,
    #[serde(default)]
    pub key_points: Vec<String>,
    pub last_updated: DateTime<Utc>,
    pub version: u64,
}

impl SessionSummary {
    pub fn new(original_question: impl Into<String>) -> Self {
        Self {
            original_question: original_question.into(),
            latest_exchange: None,
            key_points: Vec::new(),
            last_updated: Utc::now(),
            version: 0,
        }
    }

    /// Append `points`, skipping ones already present and evicting the
    /// oldest entries beyond [`KEY_POINTS_CAP`].
    pub fn merge_key_points(&mut self, points: &[String]) {
        for point in points {
            if self.key_points.iter().any(|p| p == point) {
                continue;
            }
            self.key_points.push(point.clone());
            if self.key_points.len() > KEY_POINTS_CAP {
                self.key_points.remove(0);
            }
        }
    }
}

/// One semantic conversation between a user (in a role) and the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub role: SessionRole,
    pub status: SessionStatus,
    pub summary: SessionSummary,
    /// Key of the full message history list in the backend. The summary
    /// never holds full texts; they live behind this key.
    pub full_context_key: String,
    /// The asker this expert session serves. Present iff `role == Expert`.
    pub related_user_id: Option<UserId>,
    pub domain: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub message_count: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Session {
    /// Lazy-expiry check: an expired record is surfaced as absent.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Expired || self.expires_at <= now
    }

    /// Recompute `expires_at` from the current status.
    ///
    /// RESOLVED keeps the deadline fixed at transition-time + 24h; any
    /// other status slides with activity.
    pub fn rewrite_expiry(&mut self, previous_status: SessionStatus, now: DateTime<Utc>) {
        self.expires_at = match self.status {
            SessionStatus::Resolved if previous_status != SessionStatus::Resolved => {
                now + Duration::seconds(RESOLVED_TTL_SECS)
            }
            SessionStatus::Resolved => self.expires_at,
            _ => self.last_active_at + Duration::seconds(ACTIVE_TTL_SECS),
        };
    }
}

/// Result of a candidate-session query, split by the user's two identities.
///
/// Both lists are sorted by `last_active_at` descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionQueryResult {
    pub user_id: UserId,
    pub as_user: Vec<Session>,
    pub as_expert: Vec<Session>,
    pub total_count: usize,
}

impl SessionQueryResult {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            as_user: Vec::new(),
            as_expert: Vec::new(),
            total_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }
}

/// One entry in the append-only per-session message history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: SnapshotRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}
