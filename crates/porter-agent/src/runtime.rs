use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use porter_core::types::AgentSessionId;

use crate::client::{AgentClient, AgentInvocation};
use crate::error::Result;
use crate::pool::{ClientFactory, ClientPool};
use crate::protocol::{AgentEvent, ContentBlock, TurnResult};

/// One turn to run against the agent runtime.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Agent-side conversation to resume; `None` starts a fresh one.
    pub resume: Option<AgentSessionId>,
    /// Fully formatted message (identity header + raw content).
    pub message: String,
}

/// A tool invocation observed during the stream. Telemetry only.
#[derive(Debug, Clone)]
pub struct ToolUseNote {
    pub id: String,
    pub name: String,
}

/// Everything a consumed stream produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Concatenated assistant text blocks.
    pub text: String,
    /// Number of assistant messages seen. Zero means the runtime produced
    /// nothing; callers substitute a user-facing error.
    pub message_count: usize,
    pub tool_uses: Vec<ToolUseNote>,
    pub result: TurnResult,
}

impl TurnOutcome {
    pub fn is_empty(&self) -> bool {
        self.message_count == 0
    }
}

/// The seam between orchestration and the actual runtime.
///
/// Production uses [`CliAgentRuntime`]; tests script this trait directly.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome>;
}

/// Builds CLI clients for the pool, varying only the resume token.
pub struct CliClientFactory {
    invocation: AgentInvocation,
}

impl ClientFactory for CliClientFactory {
    type Client = AgentClient;

    fn build(&self, resume: Option<AgentSessionId>) -> AgentClient {
        let mut invocation = self.invocation.clone();
        invocation.resume = resume;
        AgentClient::new(invocation)
    }
}

/// Pooled runtime over the streaming CLI protocol.
///
/// Borrow, query, drain the stream, tear down, all in the calling task.
pub struct CliAgentRuntime {
    pool: Arc<ClientPool<CliClientFactory>>,
}

impl CliAgentRuntime {
    /// `invocation.resume` is ignored here; it is overridden per turn.
    pub fn new(invocation: AgentInvocation, pool_size: usize, max_wait: Duration) -> Self {
        Self {
            pool: Arc::new(ClientPool::new(
                CliClientFactory { invocation },
                pool_size,
                max_wait,
            )),
        }
    }

    pub fn pool(&self) -> &Arc<ClientPool<CliClientFactory>> {
        &self.pool
    }
}

#[async_trait]
impl AgentRuntime for CliAgentRuntime {
    async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let mut lease = self.pool.acquire(request.resume.clone()).await?;

        let outcome = async {
            let client = lease.client();
            client.query(&request.message).await?;

            let mut text = String::new();
            let mut message_count = 0usize;
            let mut tool_uses = Vec::new();
            let mut result = None;

            while let Some(event) = client.next_event().await? {
                match event {
                    AgentEvent::Assistant { blocks } => {
                        message_count += 1;
                        for block in blocks {
                            match block {
                                ContentBlock::Text { text: t } => text.push_str(&t),
                                ContentBlock::ToolUse { id, name, .. } => {
                                    debug!(tool = %name, "tool use observed");
                                    tool_uses.push(ToolUseNote { id, name });
                                }
                            }
                        }
                    }
                    AgentEvent::Result(r) => {
                        result = Some(r);
                        break;
                    }
                }
            }

            // A stream that ended without a terminal result is treated as
            // an empty, errored turn rather than a hard failure.
            let result = result.unwrap_or(TurnResult {
                agent_session_id: None,
                num_turns: 0,
                duration_ms: 0,
                is_error: true,
                result: Some("stream ended without a result".to_string()),
            });

            info!(
                message_count,
                num_turns = result.num_turns,
                duration_ms = result.duration_ms,
                is_error = result.is_error,
                "turn complete"
            );

            Ok(TurnOutcome {
                text,
                message_count,
                tool_uses,
                result,
            })
        }
        .await;

        lease.finish().await;
        outcome
    }
}
