use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use porter_core::types::{SessionId, UserId};
use porter_identity::IdentityRecord;
use porter_sessions::{Session, SessionQueryResult};

use crate::runtime::{AgentRuntime, TurnRequest};

/// Below this confidence a match is never trusted: the decision is forced
/// to a new session.
const FORCE_NEW_BELOW: f64 = 0.5;

/// At or below this confidence the decision is journalled for review.
pub const AUDIT_BELOW: f64 = 0.7;

/// System prompt for the routing judge. The rules here are written so a
/// deterministic rule engine could stand in for the model:
/// message classification, time-first matching for fuzzy replies,
/// semantic-first matching for topical ones, expert restriction for
/// answer-shaped messages, dual-identity precedence, confidence bands.
pub const ROUTING_PROMPT: &str = r#"You are a session routing judge. Given a user's new message and their candidate sessions, decide which existing session the message continues, or whether it starts a new one.

You will receive one JSON object:
{
  "user_id": "...",
  "new_message": "...",
  "current_time": "<RFC3339>",
  "user_info": { "is_expert": bool, "expert_domains": [".."] },
  "candidate_sessions": {
    "as_user":   [ { "session_id", "status", "summary", "last_active_at", "created_at", ... } ],
    "as_expert": [ ... ]
  }
}
Both candidate lists are already sorted by last_active_at, newest first.

Classify the message first:
- A fuzzy reply is short (under 10 characters), has no domain keywords, or is a confirmation/sentiment token ("ok", "thanks", "satisfied").
- A topical message contains a recognisable subject.
- An answer-shaped message contains assertions or directives rather than questions.

Then apply these rules:
1. Fuzzy replies match time-first: walk candidates in recency order and bind to the first whose continuation is plausible. If the newest candidate is more than 2 hours stale, weaken the match. If every candidate is older than 72 hours, return NEW_SESSION.
2. Topical messages match semantics-first: pick the strongest topical match regardless of recency; break ties by recency.
3. Answer-shaped messages from a user with waiting_expert sessions in as_expert: restrict candidates to those sessions.
4. When both lists could match, prefer the more recently active session, then active status over waiting_expert.
5. Confidence bands: >= 0.9 strong continuation; 0.7-0.9 plausible; 0.5-0.7 weak; below 0.5 you must return NEW_SESSION.

Reply with exactly one JSON object and nothing else:
{
  "decision": "<session_id from the candidates>" | "NEW_SESSION",
  "confidence": <0.0-1.0>,
  "reasoning": "<one or two sentences>",
  "matched_role": "user" | "expert" | null
}
Never answer the user's message. Never return a session_id that is not in the candidate lists."#;

/// Which candidate list the decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchedRole {
    User,
    Expert,
}

impl MatchedRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchedRole::User => "user",
            MatchedRole::Expert => "expert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Existing(SessionId),
    NewSession,
}

impl RouteTarget {
    pub fn as_str(&self) -> &str {
        match self {
            RouteTarget::Existing(id) => id.as_str(),
            RouteTarget::NewSession => "NEW_SESSION",
        }
    }
}

/// The router's verdict for one inbound message.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    pub confidence: f64,
    pub reasoning: String,
    pub matched_role: Option<MatchedRole>,
}

impl RoutingDecision {
    fn new_session(confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            target: RouteTarget::NewSession,
            confidence,
            reasoning: reasoning.into(),
            matched_role: None,
        }
    }

    pub fn needs_audit(&self) -> bool {
        self.confidence < AUDIT_BELOW
    }
}

/// What the judge sees of one candidate session.
#[derive(Serialize)]
struct CandidateView<'a> {
    session_id: &'a str,
    status: &'a porter_sessions::SessionStatus,
    summary: &'a porter_sessions::SessionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    related_user_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<&'a str>,
    last_active_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl<'a> From<&'a Session> for CandidateView<'a> {
    fn from(s: &'a Session) -> Self {
        Self {
            session_id: s.session_id.as_str(),
            status: &s.status,
            summary: &s.summary,
            related_user_id: s.related_user_id.as_ref().map(|u| u.as_str()),
            domain: s.domain.as_deref(),
            last_active_at: s.last_active_at,
            created_at: s.created_at,
        }
    }
}

#[derive(Deserialize)]
struct WireDecision {
    decision: String,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    matched_role: Option<MatchedRole>,
}

/// Routes inbound messages to sessions via a short-lived judge call.
///
/// Routing never fails upward: every degenerate case (judge unreachable,
/// malformed reply, hallucinated session id) collapses to NEW_SESSION so
/// the turn can proceed.
pub struct SessionRouter {
    runtime: Arc<dyn AgentRuntime>,
}

impl SessionRouter {
    pub fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn route(
        &self,
        user_id: &UserId,
        new_message: &str,
        identity: &IdentityRecord,
        candidates: &SessionQueryResult,
    ) -> RoutingDecision {
        // Fast path: nothing to match against, no judge call.
        if candidates.is_empty() {
            info!(user_id = %user_id, "no candidate sessions, fast-path new session");
            return RoutingDecision::new_session(1.0, "no history");
        }

        let request = serde_json::json!({
            "user_id": user_id,
            "new_message": new_message,
            "current_time": Utc::now().to_rfc3339(),
            "user_info": {
                "is_expert": identity.is_expert,
                "expert_domains": identity.expert_domains,
            },
            "candidate_sessions": {
                "as_user": candidates.as_user.iter().map(CandidateView::from).collect::<Vec<_>>(),
                "as_expert": candidates.as_expert.iter().map(CandidateView::from).collect::<Vec<_>>(),
            },
        });

        info!(
            user_id = %user_id,
            as_user = candidates.as_user.len(),
            as_expert = candidates.as_expert.len(),
            "routing message"
        );

        let outcome = match self
            .runtime
            .run_turn(TurnRequest {
                resume: None,
                message: request.to_string(),
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "routing judge unreachable");
                return RoutingDecision::new_session(0.0, format!("router error: {e}"));
            }
        };

        match parse_decision(&outcome.text, candidates) {
            Ok(decision) => {
                info!(
                    user_id = %user_id,
                    decision = decision.target.as_str(),
                    confidence = decision.confidence,
                    "routing decision"
                );
                decision
            }
            Err(reason) => {
                warn!(user_id = %user_id, reason, "unusable routing reply");
                RoutingDecision::new_session(0.0, format!("router error: {reason}"))
            }
        }
    }
}

/// Parse the first well-formed JSON object in the judge's reply and
/// validate it against the candidate set.
fn parse_decision(
    text: &str,
    candidates: &SessionQueryResult,
) -> std::result::Result<RoutingDecision, String> {
    let object = first_json_object(text).ok_or("no JSON object in reply")?;
    let wire: WireDecision =
        serde_json::from_str(object).map_err(|e| format!("bad decision object: {e}"))?;

    let confidence = wire.confidence.clamp(0.0, 1.0);

    if wire.decision == "NEW_SESSION" {
        return Ok(RoutingDecision {
            target: RouteTarget::NewSession,
            confidence,
            reasoning: wire.reasoning,
            matched_role: None,
        });
    }

    let in_user = candidates
        .as_user
        .iter()
        .any(|s| s.session_id.as_str() == wire.decision);
    let in_expert = candidates
        .as_expert
        .iter()
        .any(|s| s.session_id.as_str() == wire.decision);
    if !in_user && !in_expert {
        return Err(format!("decision '{}' is not a candidate", wire.decision));
    }

    // Sub-0.5 matches are never trusted.
    if confidence < FORCE_NEW_BELOW {
        return Ok(RoutingDecision {
            target: RouteTarget::NewSession,
            confidence,
            reasoning: wire.reasoning,
            matched_role: None,
        });
    }

    let matched_role = wire.matched_role.or(if in_expert {
        Some(MatchedRole::Expert)
    } else {
        Some(MatchedRole::User)
    });

    Ok(RoutingDecision {
        target: RouteTarget::Existing(SessionId::from(wire.decision)),
        confidence,
        reasoning: wire.reasoning,
        matched_role,
    })
}

/// Locate the first balanced `{ … }` span, honouring string literals and
/// escapes, so a decision can be fished out of surrounding prose.
fn first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use porter_sessions::{SessionRole, SessionStatus, SessionSummary};

    use crate::error::AgentError;
    use crate::runtime::TurnOutcome;
    use crate::protocol::TurnResult;

    fn session(id: &str, role: SessionRole, question: &str, age_mins: i64) -> Session {
        let at = Utc::now() - Duration::minutes(age_mins);
        Session {
            session_id: SessionId::from(id),
            user_id: "emp001".into(),
            role,
            status: if role == SessionRole::Expert {
                SessionStatus::WaitingExpert
            } else {
                SessionStatus::Active
            },
            summary: SessionSummary::new(question),
            full_context_key: format!("session_history:{id}"),
            related_user_id: if role == SessionRole::Expert {
                Some("emp002".into())
            } else {
                None
            },
            domain: None,
            created_at: at,
            last_active_at: at,
            expires_at: at + Duration::days(7),
            message_count: 1,
            tags: vec![],
        }
    }

    fn candidates(sessions: Vec<Session>) -> SessionQueryResult {
        let (as_expert, as_user): (Vec<_>, Vec<_>) = sessions
            .into_iter()
            .partition(|s| s.role == SessionRole::Expert);
        let total_count = as_user.len() + as_expert.len();
        SessionQueryResult {
            user_id: "emp001".into(),
            as_user,
            as_expert,
            total_count,
        }
    }

    fn identity() -> IdentityRecord {
        IdentityRecord::unknown("emp001".into())
    }

    /// Runtime that replies with a fixed text, or panics when the fast
    /// path should have skipped the call.
    struct Scripted {
        reply: Option<String>,
        fail: bool,
    }

    #[async_trait]
    impl AgentRuntime for Scripted {
        async fn run_turn(&self, _request: TurnRequest) -> crate::error::Result<TurnOutcome> {
            if self.fail {
                return Err(AgentError::Unavailable("down".into()));
            }
            let reply = self
                .reply
                .clone()
                .expect("judge must not be called on the fast path");
            Ok(TurnOutcome {
                text: reply,
                message_count: 1,
                tool_uses: vec![],
                result: TurnResult {
                    agent_session_id: None,
                    num_turns: 1,
                    duration_ms: 10,
                    is_error: false,
                    result: None,
                },
            })
        }
    }

    fn router(reply: Option<&str>, fail: bool) -> SessionRouter {
        SessionRouter::new(Arc::new(Scripted {
            reply: reply.map(str::to_string),
            fail,
        }))
    }

    #[tokio::test]
    async fn empty_candidates_fast_path() {
        let r = router(None, false);
        let decision = r
            .route(
                &"emp999".into(),
                "anything at all",
                &identity(),
                &SessionQueryResult::empty("emp999".into()),
            )
            .await;
        assert_eq!(decision.target, RouteTarget::NewSession);
        assert_eq!(decision.confidence, 1.0);
        assert_eq!(decision.reasoning, "no history");
        assert!(decision.matched_role.is_none());
    }

    #[tokio::test]
    async fn valid_decision_binds_to_candidate() {
        let c = candidates(vec![
            session("sess_aaa", SessionRole::User, "annual leave", 25),
            session("sess_ccc", SessionRole::User, "attendance", 5),
        ]);
        let r = router(
            Some(
                r#"Here is my verdict:
                {"decision":"sess_ccc","confidence":0.85,"reasoning":"fuzzy reply binds to newest","matched_role":"user"}"#,
            ),
            false,
        );
        let decision = r.route(&"emp001".into(), "satisfied", &identity(), &c).await;
        assert_eq!(
            decision.target,
            RouteTarget::Existing(SessionId::from("sess_ccc"))
        );
        assert_eq!(decision.matched_role, Some(MatchedRole::User));
        assert!(!decision.needs_audit());
    }

    #[tokio::test]
    async fn hallucinated_session_id_degrades() {
        let c = candidates(vec![session("sess_aaa", SessionRole::User, "q", 5)]);
        let r = router(
            Some(r#"{"decision":"sess_zzz","confidence":0.9,"reasoning":"?"}"#),
            false,
        );
        let decision = r.route(&"emp001".into(), "hi", &identity(), &c).await;
        assert_eq!(decision.target, RouteTarget::NewSession);
        assert_eq!(decision.confidence, 0.0);
        assert!(decision.reasoning.starts_with("router error:"));
    }

    #[tokio::test]
    async fn sub_half_confidence_forces_new_session() {
        let c = candidates(vec![session("sess_aaa", SessionRole::User, "q", 5)]);
        let r = router(
            Some(r#"{"decision":"sess_aaa","confidence":0.4,"reasoning":"weak"}"#),
            false,
        );
        let decision = r.route(&"emp001".into(), "hmm", &identity(), &c).await;
        assert_eq!(decision.target, RouteTarget::NewSession);
        assert!(decision.needs_audit());
    }

    #[tokio::test]
    async fn malformed_reply_degrades() {
        let c = candidates(vec![session("sess_aaa", SessionRole::User, "q", 5)]);
        let r = router(Some("I think it belongs to the first one."), false);
        let decision = r.route(&"emp001".into(), "hi", &identity(), &c).await;
        assert_eq!(decision.target, RouteTarget::NewSession);
        assert_eq!(decision.confidence, 0.0);
    }

    #[tokio::test]
    async fn judge_failure_degrades() {
        let c = candidates(vec![session("sess_aaa", SessionRole::User, "q", 5)]);
        let r = router(None, true);
        let decision = r.route(&"emp001".into(), "hi", &identity(), &c).await;
        assert_eq!(decision.target, RouteTarget::NewSession);
        assert!(decision.reasoning.starts_with("router error:"));
    }

    #[tokio::test]
    async fn expert_match_infers_role_from_list() {
        let c = candidates(vec![session(
            "sess_xxx",
            SessionRole::Expert,
            "onboarding materials",
            35,
        )]);
        let r = router(
            Some(r#"{"decision":"sess_xxx","confidence":0.98,"reasoning":"answer-shaped"}"#),
            false,
        );
        let decision = r
            .route(
                &"exp001".into(),
                "bring original ID and a copy of the diploma",
                &identity(),
                &c,
            )
            .await;
        assert_eq!(decision.matched_role, Some(MatchedRole::Expert));
    }

    #[test]
    fn json_extraction_handles_nesting_and_strings() {
        let text = r#"prefix {"decision":"NEW_SESSION","confidence":0.9,"reasoning":"braces \" } in string","extra":{"nested":1}} suffix"#;
        let object = first_json_object(text).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(object).unwrap();
        assert_eq!(parsed["decision"], "NEW_SESSION");
        assert!(first_json_object("no objects here").is_none());
    }
}
