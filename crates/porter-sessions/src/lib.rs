//! Session state for the routing gateway.
//!
//! Three stores share one [`KvBackend`](porter_storage::KvBackend):
//!
//! - [`SessionStore`]: semantic conversation records with dual indexes,
//!   status-derived TTLs and optimistic-concurrency summary updates;
//! - [`ConversationStateStore`]: the per-user expert-mediation state
//!   machine;
//! - [`AgentSessionStore`]: the user to agent-runtime resume-token mapping.
//!
//! All components outside this crate hold short-lived value copies; the
//! only mutation paths are `create` and `cas_update`.

pub mod agent_session;
pub mod convstate;
pub mod error;
pub mod store;
pub mod types;

pub use agent_session::{AgentSessionStore, UserSessionMapping};
pub use convstate::{
    ConversationContext, ConversationPatch, ConversationState, ConversationStateStore,
};
pub use error::{Result, SessionError};
pub use store::{CasResult, NewSession, SessionQueryOptions, SessionStore, SummaryUpdate};
pub use types::{
    HistoryMessage, MessageSnapshot, Session, SessionQueryResult, SessionRole, SessionStatus,
    SessionSummary, SnapshotRole,
};
