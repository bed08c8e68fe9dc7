//! Agent-runtime consumption: the streaming wire protocol, the pooled
//! subprocess client, and the session router built on top of it.
//!
//! The remote runtime uses a nested task-group protocol internally, so a
//! client must be constructed and torn down in the same task. The pool
//! therefore recycles a concurrency budget (a semaphore), never connected
//! clients. See [`pool::ClientPool`].

pub mod client;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod runtime;

pub use client::{AgentClient, AgentInvocation};
pub use error::{AgentError, Result};
pub use pool::{ClientFactory, ClientPool, PoolRegistry, PoolStats, PoolableClient};
pub use protocol::{AgentEvent, ContentBlock, TurnResult};
pub use router::{MatchedRole, RouteTarget, RoutingDecision, SessionRouter};
pub use runtime::{AgentRuntime, CliAgentRuntime, ToolUseNote, TurnOutcome, TurnRequest};
