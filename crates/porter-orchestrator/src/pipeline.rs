use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use porter_agent::{
    AgentError, AgentRuntime, MatchedRole, RouteTarget, RoutingDecision, SessionRouter,
    TurnOutcome, TurnRequest,
};
use porter_audit::AuditLogger;
use porter_channels::{InboundMessage, TurnHandler};
use porter_core::types::{SessionId, UserId};
use porter_identity::{IdentityRecord, IdentityService};
use porter_sessions::{
    AgentSessionStore, ConversationPatch, ConversationState, ConversationStateStore,
    HistoryMessage, MessageSnapshot, NewSession, SessionQueryOptions, SessionQueryResult,
    SessionRole, SessionStatus, SessionStore, SnapshotRole, SummaryUpdate,
};

use crate::metadata::{extract_metadata, ReportedStatus, TurnMetadata};

/// Summary snapshots carry at most this many characters; full texts go to
/// the history store.
const SNAPSHOT_CHARS: usize = 200;

/// User-visible failure strings. The orchestrator is the only place that
/// turns internal errors into text.
const REPLY_EMPTY_STREAM: &str =
    "No response from the knowledge base, please try again later.";
const REPLY_POOL_BUSY: &str =
    "The assistant is handling too many requests right now. Please retry in a moment.";
const REPLY_RUNTIME_DOWN: &str =
    "Sorry, something went wrong while processing your message. Please try again later.";

/// What one turn produced, ready for the channel adapter.
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub text: String,
    pub session_id: Option<SessionId>,
    pub resolved: bool,
    /// True when the text is a substituted failure message.
    pub is_error: bool,
}

impl TurnReply {
    fn failed(text: &str) -> Self {
        Self {
            text: text.to_string(),
            session_id: None,
            resolved: false,
            is_error: true,
        }
    }
}

/// End-to-end per-message pipeline.
///
/// Holds two runtime handles: the pooled turn runtime for user traffic and
/// a separate judge runtime inside the router, so routing bursts cannot
/// starve user turns.
pub struct Orchestrator {
    identity: Arc<IdentityService>,
    sessions: Arc<SessionStore>,
    agent_sessions: Arc<AgentSessionStore>,
    conv_state: Arc<ConversationStateStore>,
    runtime: Arc<dyn AgentRuntime>,
    router: SessionRouter,
    audit: Arc<AuditLogger>,
}

impl Orchestrator {
    pub fn new(
        identity: Arc<IdentityService>,
        sessions: Arc<SessionStore>,
        agent_sessions: Arc<AgentSessionStore>,
        conv_state: Arc<ConversationStateStore>,
        runtime: Arc<dyn AgentRuntime>,
        router_runtime: Arc<dyn AgentRuntime>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            identity,
            sessions,
            agent_sessions,
            conv_state,
            runtime,
            router: SessionRouter::new(router_runtime),
            audit,
        }
    }

    /// Run one user turn, start to finish. Never fails upward: every
    /// internal error becomes a user-visible reply.
    pub async fn handle_message(&self, message: &InboundMessage) -> TurnReply {
        let user_id = &message.user.user_id;
        info!(user_id = %user_id, message_id = %message.message_id, "handling inbound message");

        // 1. Identify. Infallible: an unreachable identity source yields
        //    an unknown, non-expert record and the turn continues.
        let identity = self.identity.identify(user_id);

        // 2. Resolve the routing decision.
        let candidates = self.query_candidates(user_id).await;
        let decision = self
            .router
            .route(user_id, &message.content, &identity, &candidates)
            .await;
        self.audit_if_needed(user_id, &message.content, &decision);

        // 3. Materialise the session.
        let session = match self
            .materialise_session(user_id, &identity, &message.content, &decision)
            .await
        {
            Some(session) => session,
            None => {
                error!(user_id = %user_id, "could not materialise a session");
                return TurnReply::failed(REPLY_RUNTIME_DOWN);
            }
        };
        let session_id = session.session_id.clone();

        // 4. Resolve the resume token.
        let resume = match self.agent_sessions.get(user_id).await {
            Ok(mapping) => mapping.and_then(|m| m.agent_session_id),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "resume lookup failed, starting fresh");
                None
            }
        };

        // 5-6. Borrow a pooled client and stream the turn.
        let outcome = match self
            .runtime
            .run_turn(TurnRequest {
                resume,
                message: format_agent_message(&identity, &message.content),
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(AgentError::PoolTimeout { ms }) => {
                warn!(user_id = %user_id, ms, "pool acquisition timed out");
                return TurnReply::failed(REPLY_POOL_BUSY);
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "agent turn failed");
                return TurnReply::failed(REPLY_RUNTIME_DOWN);
            }
        };

        // Empty stream or errored terminal result: substitute a graceful
        // reply, leave status and summary untouched.
        if outcome.is_empty() {
            warn!(user_id = %user_id, session_id = %session_id, "agent produced no messages");
            return TurnReply {
                text: REPLY_EMPTY_STREAM.to_string(),
                session_id: Some(session_id),
                resolved: false,
                is_error: true,
            };
        }
        if outcome.result.is_error {
            let text = outcome
                .result
                .result
                .clone()
                .unwrap_or_else(|| REPLY_RUNTIME_DOWN.to_string());
            warn!(user_id = %user_id, session_id = %session_id, "agent reported an error result");
            return TurnReply {
                text,
                session_id: Some(session_id),
                resolved: false,
                is_error: true,
            };
        }

        // 7. Extract and strip the metadata block.
        let (clean_text, metadata) = extract_metadata(&outcome.text);
        if metadata.is_none() {
            warn!(session_id = %session_id, "no metadata block in agent response");
        }

        // 8. Update the summary under CAS (and expert-mediation state).
        let resolved = self
            .update_session_state(&session_id, user_id, &message.content, &clean_text, &metadata)
            .await;
        if let Some(ref metadata) = metadata {
            self.track_expert_mediation(&session_id, user_id, &message.content, metadata, &decision)
                .await;
        }

        // 9. Persist the runtime's session id for the next turn.
        self.persist_agent_session(user_id, &session_id, &outcome).await;

        // 10. Emit.
        TurnReply {
            text: clean_text,
            session_id: Some(session_id),
            resolved,
            is_error: false,
        }
    }

    async fn query_candidates(&self, user_id: &UserId) -> SessionQueryResult {
        match self
            .sessions
            .query_by_user(user_id, SessionQueryOptions::default())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                // Degraded store: route as a fresh user rather than fail.
                warn!(user_id = %user_id, error = %e, "candidate query failed");
                SessionQueryResult::empty(user_id.clone())
            }
        }
    }

    fn audit_if_needed(&self, user_id: &UserId, content: &str, decision: &RoutingDecision) {
        if !decision.needs_audit() {
            return;
        }
        if let Err(e) = self.audit.log_low_confidence_routing(
            user_id,
            content,
            decision.target.as_str(),
            decision.confidence,
            &decision.reasoning,
            decision.matched_role.map(|r| r.as_str()),
            true,
        ) {
            error!(user_id = %user_id, error = %e, "audit write failed");
        }
    }

    /// Load the routed session, or create one on NEW_SESSION. Role
    /// derivation: EXPERT only when the router matched the expert side
    /// and a pending mediation names the asker; a registered expert
    /// asking for themselves gets EXPERT_AS_USER.
    async fn materialise_session(
        &self,
        user_id: &UserId,
        identity: &IdentityRecord,
        content: &str,
        decision: &RoutingDecision,
    ) -> Option<porter_sessions::Session> {
        if let RouteTarget::Existing(ref id) = decision.target {
            match self.sessions.get(id).await {
                Ok(Some(session)) => {
                    info!(user_id = %user_id, session_id = %id, "continuing session");
                    return Some(session);
                }
                Ok(None) => {
                    // Expired between routing and load; fall through.
                    warn!(session_id = %id, "routed session vanished, creating a new one");
                }
                Err(e) => {
                    warn!(session_id = %id, error = %e, "session load failed, creating a new one");
                }
            }
        }

        let (role, related_user_id, domain) =
            if identity.is_expert && decision.matched_role == Some(MatchedRole::Expert) {
                match self.conv_state.find_pending_for_expert(user_id).await {
                    Ok(Some(pending)) => (
                        SessionRole::Expert,
                        Some(pending.user_id.clone()),
                        pending.domain.clone(),
                    ),
                    // No asker on record: treat as the expert's own question.
                    _ => (SessionRole::ExpertAsUser, None, None),
                }
            } else if identity.is_expert {
                (SessionRole::ExpertAsUser, None, None)
            } else {
                (SessionRole::User, None, None)
            };

        match self
            .sessions
            .create(NewSession {
                user_id: user_id.clone(),
                role,
                original_question: content.to_string(),
                related_user_id,
                domain,
            })
            .await
        {
            Ok(session) => Some(session),
            Err(e) => {
                error!(user_id = %user_id, error = %e, "session create failed");
                None
            }
        }
    }

    /// One CAS-guarded summary write per turn, plus the history appends.
    /// Returns whether this turn resolved the session.
    async fn update_session_state(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        user_text: &str,
        agent_text: &str,
        metadata: &Option<TurnMetadata>,
    ) -> bool {
        let now = Utc::now();

        for (role, content) in [(SnapshotRole::User, user_text), (SnapshotRole::Agent, agent_text)]
        {
            if let Err(e) = self
                .sessions
                .append_history(
                    session_id,
                    &HistoryMessage {
                        role,
                        content: content.to_string(),
                        timestamp: now,
                    },
                )
                .await
            {
                warn!(session_id = %session_id, error = %e, "history append failed");
            }
        }

        let status = metadata.as_ref().and_then(|m| match m.session_status {
            ReportedStatus::Resolved => Some(SessionStatus::Resolved),
            ReportedStatus::Active if m.expert_routed == Some(true) => {
                Some(SessionStatus::WaitingExpert)
            }
            ReportedStatus::Active => None,
        });
        let resolved = status == Some(SessionStatus::Resolved);

        let update = SummaryUpdate {
            new_message: Some(MessageSnapshot {
                content: truncate_chars(agent_text, SNAPSHOT_CHARS),
                timestamp: now,
                role: SnapshotRole::Agent,
            }),
            key_points: metadata
                .as_ref()
                .map(|m| m.key_points.clone())
                .unwrap_or_default(),
            status,
            tags: Vec::new(),
        };

        // A storage hiccup here must not cost the user their reply: log
        // the structured error and move on.
        if let Err(e) = self.sessions.update_summary(session_id, update).await {
            error!(
                session_id = %session_id,
                user_id = %user_id,
                error = %e,
                "summary update failed, reply still delivered"
            );
            return false;
        }
        resolved
    }

    /// Keep the expert-mediation state machine in step with the turn.
    async fn track_expert_mediation(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        user_text: &str,
        metadata: &TurnMetadata,
        decision: &RoutingDecision,
    ) {
        // Agent routed this question to an expert: the asker now waits.
        if metadata.expert_routed == Some(true) {
            if let Some(ref expert_user_id) = metadata.expert_user_id {
                let patch = ConversationPatch {
                    state: Some(ConversationState::WaitingForExpert),
                    user_question: Some(
                        metadata
                            .original_question
                            .clone()
                            .unwrap_or_else(|| user_text.to_string()),
                    ),
                    domain: metadata.domain.clone(),
                    expert_user_id: Some(UserId::from(expert_user_id.as_str())),
                    expert_name: metadata.expert_name.clone(),
                    contacted_at: Some(Utc::now()),
                    ..Default::default()
                };
                if let Err(e) = self.conv_state.update(user_id, patch).await {
                    warn!(user_id = %user_id, error = %e, "failed to record expert contact");
                }
            }
        }

        // An expert answered one of their pending questions: complete the
        // asker's slot.
        if decision.matched_role == Some(MatchedRole::Expert)
            && metadata.session_status == ReportedStatus::Resolved
        {
            let asker = match self.sessions.get(session_id).await {
                Ok(Some(session)) => session.related_user_id,
                _ => None,
            };
            if let Some(asker) = asker {
                let patch = ConversationPatch {
                    state: Some(ConversationState::Completed),
                    expert_reply: Some(user_text.to_string()),
                    ..Default::default()
                };
                if let Err(e) = self.conv_state.update(&asker, patch).await {
                    warn!(user_id = %asker, error = %e, "failed to complete mediation");
                }
            }
        }
    }

    /// Write back the runtime's canonical session id when it changed
    /// (first assignment included) before the reply is emitted, so the
    /// user's next turn resumes this context.
    async fn persist_agent_session(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
        outcome: &TurnOutcome,
    ) {
        let Some(ref new_id) = outcome.result.agent_session_id else {
            return;
        };
        let stored = match self.agent_sessions.get(user_id).await {
            Ok(mapping) => mapping.and_then(|m| m.agent_session_id),
            Err(_) => None,
        };
        if stored.as_ref() == Some(new_id) {
            return;
        }
        if let Err(e) = self
            .agent_sessions
            .put(user_id, Some(session_id.clone()), Some(new_id.clone()))
            .await
        {
            error!(user_id = %user_id, error = %e, "failed to persist agent session id");
        }
    }
}

#[async_trait]
impl TurnHandler for Orchestrator {
    async fn handle(&self, message: &InboundMessage) -> String {
        self.handle_message(message).await.text
    }
}

/// Identity header + raw content, the shape the assistant prompt expects.
fn format_agent_message(identity: &IdentityRecord, content: &str) -> String {
    let name = if identity.name.is_empty() {
        identity.user_id.as_str()
    } else {
        &identity.name
    };
    format!(
        "[user]\nuser_id: {}\nname: {}\n\n[message]\n{}",
        identity.user_id, name, content
    )
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_message_carries_identity_header() {
        let mut identity = IdentityRecord::unknown("emp001".into());
        identity.name = "Ada".into();
        let formatted = format_agent_message(&identity, "how do I file leave?");
        assert!(formatted.starts_with("[user]\nuser_id: emp001\nname: Ada\n"));
        assert!(formatted.ends_with("[message]\nhow do I file leave?"));
    }

    #[test]
    fn header_falls_back_to_user_id() {
        let identity = IdentityRecord::unknown("emp001".into());
        let formatted = format_agent_message(&identity, "hi");
        assert!(formatted.contains("name: emp001"));
    }
}
