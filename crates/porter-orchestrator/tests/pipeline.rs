//! End-to-end pipeline behaviour with scripted runtimes and in-process
//! stores: metadata flow, resume-token persistence, routing integration
//! and failure substitution.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use porter_agent::{AgentError, AgentRuntime, TurnOutcome, TurnRequest, TurnResult};
use porter_audit::{AuditLogger, TracingAlertSink};
use porter_channels::{ChannelUser, InboundMessage, MessageKind};
use porter_core::types::UserId;
use porter_identity::IdentityService;
use porter_orchestrator::Orchestrator;
use porter_sessions::{
    AgentSessionStore, ConversationStateStore, SessionQueryOptions, SessionStatus, SessionStore,
};
use porter_storage::MemoryBackend;

/// Turn runtime that pops scripted outcomes and records every request.
#[derive(Default)]
struct ScriptedTurns {
    replies: Mutex<VecDeque<Result<TurnOutcome, AgentError>>>,
    requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedTurns {
    fn push_text(&self, text: &str, agent_session: &str) {
        self.replies.lock().unwrap().push_back(Ok(outcome(text, agent_session, false)));
    }

    fn push(&self, result: Result<TurnOutcome, AgentError>) {
        self.replies.lock().unwrap().push_back(result);
    }

    fn request(&self, index: usize) -> TurnRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

fn outcome(text: &str, agent_session: &str, is_error: bool) -> TurnOutcome {
    TurnOutcome {
        text: text.to_string(),
        message_count: if text.is_empty() { 0 } else { 1 },
        tool_uses: vec![],
        result: TurnResult {
            agent_session_id: Some(agent_session.into()),
            num_turns: 1,
            duration_ms: 42,
            is_error,
            result: if is_error {
                Some("the runtime hit an internal error".to_string())
            } else {
                None
            },
        },
    }
}

#[async_trait]
impl AgentRuntime for ScriptedTurns {
    async fn run_turn(&self, request: TurnRequest) -> porter_agent::Result<TurnOutcome> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("no scripted reply left")
    }
}

/// Judge runtime that always binds to the newest as_user candidate.
struct NewestCandidateJudge;

#[async_trait]
impl AgentRuntime for NewestCandidateJudge {
    async fn run_turn(&self, request: TurnRequest) -> porter_agent::Result<TurnOutcome> {
        let input: serde_json::Value = serde_json::from_str(&request.message).unwrap();
        let newest = input["candidate_sessions"]["as_user"][0]["session_id"]
            .as_str()
            .expect("judge called with no candidates")
            .to_string();
        let reply = format!(
            r#"{{"decision":"{newest}","confidence":0.92,"reasoning":"continuation","matched_role":"user"}}"#
        );
        Ok(outcome(&reply, "judge-session", false))
    }
}

/// Judge that shrugs: a weak NEW_SESSION verdict that must be journalled.
struct UncertainJudge;

#[async_trait]
impl AgentRuntime for UncertainJudge {
    async fn run_turn(&self, _request: TurnRequest) -> porter_agent::Result<TurnOutcome> {
        Ok(outcome(
            r#"{"decision":"NEW_SESSION","confidence":0.6,"reasoning":"no strong overlap","matched_role":null}"#,
            "judge-session",
            false,
        ))
    }
}

/// Judge that must never be consulted (fast-path assertions).
struct PanickingJudge;

#[async_trait]
impl AgentRuntime for PanickingJudge {
    async fn run_turn(&self, _request: TurnRequest) -> porter_agent::Result<TurnOutcome> {
        panic!("router must not be called on the fast path");
    }
}

struct Harness {
    orchestrator: Orchestrator,
    sessions: Arc<SessionStore>,
    turns: Arc<ScriptedTurns>,
    _audit_dir: tempfile::TempDir,
}

fn harness(judge: Arc<dyn AgentRuntime>) -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    let sessions = Arc::new(SessionStore::new(backend.clone()));
    let agent_sessions = Arc::new(AgentSessionStore::new(backend.clone()));
    let conv_state = Arc::new(ConversationStateStore::new(
        backend,
        "webchat",
        Duration::from_secs(86_400),
    ));
    let identity_dir = tempfile::tempdir().unwrap();
    let identity = Arc::new(IdentityService::with_table(
        identity_dir.path().join("experts.csv"),
    ));
    let audit_dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLogger::new(audit_dir.path(), Box::new(TracingAlertSink)).unwrap());
    let turns = Arc::new(ScriptedTurns::default());

    Harness {
        orchestrator: Orchestrator::new(
            identity,
            Arc::clone(&sessions),
            agent_sessions,
            conv_state,
            Arc::clone(&turns) as Arc<dyn AgentRuntime>,
            judge,
            audit,
        ),
        sessions,
        turns,
        _audit_dir: audit_dir,
    }
}

fn inbound(user_id: &str, content: &str) -> InboundMessage {
    InboundMessage {
        message_id: format!("m-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
        user: ChannelUser::bare(UserId::from(user_id), "webchat"),
        content: content.to_string(),
        kind: MessageKind::Text,
        timestamp: Utc::now(),
        attachments: vec![],
        metadata: serde_json::Value::Null,
        raw: serde_json::Value::Null,
    }
}

fn with_metadata(answer: &str, key_points: &[&str], status: &str) -> String {
    let points = key_points
        .iter()
        .map(|p| format!("\"{p}\""))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "{answer}\n\n```metadata\n{{\"key_points\":[{points}],\"answer_source\":\"knowledge_base\",\"session_status\":\"{status}\"}}\n```\n"
    )
}

#[tokio::test]
async fn first_turn_creates_session_and_strips_metadata() {
    let h = harness(Arc::new(PanickingJudge));
    h.turns.push_text(
        &with_metadata(
            "Submit the form in the portal.",
            &["sick leave", "medical certificate"],
            "active",
        ),
        "agent-1",
    );

    let reply = h
        .orchestrator
        .handle_message(&inbound("emp010", "how to request sick leave"))
        .await;

    assert!(!reply.is_error);
    assert_eq!(reply.text, "Submit the form in the portal.");
    assert!(!reply.text.contains("```"));
    assert!(!reply.resolved);

    let session = h
        .sessions
        .get(reply.session_id.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.summary.version, 1);
    assert_eq!(session.summary.key_points, vec!["sick leave", "medical certificate"]);
    assert_eq!(session.summary.original_question, "how to request sick leave");
    assert_eq!(session.status, SessionStatus::Active);

    // First turn starts a fresh agent conversation.
    assert!(h.turns.request(0).resume.is_none());
    // Full texts landed in history, summary snapshot stayed short.
    let history = h
        .sessions
        .read_history(&session.session_id, 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn resume_token_is_persisted_between_turns() {
    let h = harness(Arc::new(NewestCandidateJudge));
    h.turns
        .push_text(&with_metadata("First answer.", &["a"], "active"), "agent-77");
    h.turns
        .push_text(&with_metadata("Second answer.", &["b"], "active"), "agent-77");

    h.orchestrator
        .handle_message(&inbound("emp010", "how to request sick leave"))
        .await;
    h.orchestrator
        .handle_message(&inbound("emp010", "how many days in advance?"))
        .await;

    // The second turn resumes the id assigned by the first.
    assert!(h.turns.request(0).resume.is_none());
    assert_eq!(
        h.turns.request(1).resume.as_ref().map(|r| r.as_str()),
        Some("agent-77")
    );
}

#[tokio::test]
async fn full_lifecycle_resolves_on_third_turn() {
    let h = harness(Arc::new(NewestCandidateJudge));
    h.turns.push_text(
        &with_metadata("Portal it is.", &["sick leave", "medical certificate"], "active"),
        "agent-1",
    );
    h.turns
        .push_text(&with_metadata("One day ahead.", &["1 day in advance"], "active"), "agent-1");
    h.turns
        .push_text(&with_metadata("Glad to help!", &[], "resolved"), "agent-1");

    let r1 = h
        .orchestrator
        .handle_message(&inbound("emp010", "how to request sick leave"))
        .await;
    let session_id = r1.session_id.clone().unwrap();

    let r2 = h
        .orchestrator
        .handle_message(&inbound("emp010", "how many days in advance?"))
        .await;
    assert_eq!(r2.session_id.as_ref(), Some(&session_id));

    let r3 = h
        .orchestrator
        .handle_message(&inbound("emp010", "thanks, clear!"))
        .await;
    assert_eq!(r3.session_id.as_ref(), Some(&session_id));
    assert!(r3.resolved);

    let session = h.sessions.get(&session_id).await.unwrap().unwrap();
    assert_eq!(session.summary.version, 3);
    assert_eq!(session.summary.key_points.len(), 3);
    assert_eq!(session.status, SessionStatus::Resolved);
    assert!(session.expires_at - Utc::now() <= chrono::Duration::hours(24));
}

#[tokio::test]
async fn empty_stream_substitutes_apology_without_touching_state() {
    let h = harness(Arc::new(PanickingJudge));
    h.turns.push(Ok(outcome("", "agent-1", false)));

    let reply = h
        .orchestrator
        .handle_message(&inbound("emp001", "anyone there?"))
        .await;

    assert!(reply.is_error);
    assert!(reply.text.contains("No response from the knowledge base"));

    // The session was created (routing preceded the turn), but its
    // summary was never touched.
    let session = h
        .sessions
        .get(reply.session_id.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.summary.version, 0);
    assert_eq!(session.status, SessionStatus::Active);
}

#[tokio::test]
async fn errored_result_emits_the_error_text() {
    let h = harness(Arc::new(PanickingJudge));
    h.turns.push(Ok(outcome("partial output", "agent-1", true)));

    let reply = h
        .orchestrator
        .handle_message(&inbound("emp001", "hello"))
        .await;

    assert!(reply.is_error);
    assert_eq!(reply.text, "the runtime hit an internal error");

    let session = h
        .sessions
        .get(reply.session_id.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.summary.version, 0);
}

#[tokio::test]
async fn pool_timeout_asks_the_user_to_retry() {
    let h = harness(Arc::new(PanickingJudge));
    h.turns.push(Err(AgentError::PoolTimeout { ms: 30_000 }));

    let reply = h
        .orchestrator
        .handle_message(&inbound("emp001", "hello"))
        .await;
    assert!(reply.is_error);
    assert!(reply.text.contains("Please retry"));
}

#[tokio::test]
async fn missing_metadata_still_updates_the_summary() {
    let h = harness(Arc::new(PanickingJudge));
    h.turns.push_text("A bare answer with no block.", "agent-1");

    let reply = h
        .orchestrator
        .handle_message(&inbound("emp001", "question"))
        .await;
    assert!(!reply.is_error);

    let session = h
        .sessions
        .get(reply.session_id.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.summary.version, 1);
    assert!(session.summary.key_points.is_empty());
    let exchange = session.summary.latest_exchange.unwrap();
    assert_eq!(exchange.content, "A bare answer with no block.");
}

#[tokio::test]
async fn weak_decisions_are_journalled_for_review() {
    let h = harness(Arc::new(UncertainJudge));
    h.turns
        .push_text(&with_metadata("First.", &["a"], "active"), "agent-1");
    h.turns
        .push_text(&with_metadata("Second.", &["b"], "active"), "agent-1");

    // Turn 1 takes the fast path (full confidence, nothing journalled);
    // turn 2 consults the uncertain judge.
    h.orchestrator
        .handle_message(&inbound("emp001", "leave policy?"))
        .await;
    h.orchestrator
        .handle_message(&inbound("emp001", "unrelated mumbling"))
        .await;

    let journal =
        std::fs::read_to_string(h._audit_dir.path().join("routing_audit.jsonl")).unwrap();
    let lines: Vec<_> = journal.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["decision"], "NEW_SESSION");
    assert_eq!(record["confidence"], 0.6);
    assert_eq!(record["audit_required"], true);
    assert_eq!(record["message_preview"], "unrelated mumbling");
}

#[tokio::test]
async fn second_user_message_routes_to_existing_session() {
    let h = harness(Arc::new(NewestCandidateJudge));
    h.turns
        .push_text(&with_metadata("Answer one.", &["p1"], "active"), "agent-1");
    h.turns
        .push_text(&with_metadata("Answer two.", &["p2"], "active"), "agent-1");

    let r1 = h
        .orchestrator
        .handle_message(&inbound("emp001", "annual leave policy?"))
        .await;
    let r2 = h
        .orchestrator
        .handle_message(&inbound("emp001", "and how many days?"))
        .await;

    assert_eq!(r1.session_id, r2.session_id);
    let result = h
        .sessions
        .query_by_user(&"emp001".into(), SessionQueryOptions::default())
        .await
        .unwrap();
    assert_eq!(result.total_count, 1);
}
