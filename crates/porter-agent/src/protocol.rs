use serde::{Deserialize, Serialize};

use porter_core::types::AgentSessionId;

use crate::error::{AgentError, Result};

/// One content block inside an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

/// Terminal result of one streamed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    /// The runtime's canonical conversation id: the resume token for the
    /// next turn from the same user.
    #[serde(rename = "session_id")]
    pub agent_session_id: Option<AgentSessionId>,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub is_error: bool,
    /// Error text (or final summary) from the runtime, when present.
    pub result: Option<String>,
}

/// One NDJSON line on the runtime's stdout.
///
/// The stream is lazy, finite and non-restartable: zero or more
/// `assistant` events followed by exactly one `result`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Assistant { blocks: Vec<ContentBlock> },
    Result(TurnResult),
}

#[derive(Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(flatten)]
    rest: serde_json::Value,
}

/// Parse one stream line. Unknown event kinds (tool notifications,
/// keepalives) return `None` and are skipped by the caller.
pub fn parse_event(line: &str) -> Result<Option<AgentEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let wire: WireEvent = serde_json::from_str(line)
        .map_err(|e| AgentError::Parse(format!("bad stream line: {e}")))?;

    match wire.kind.as_str() {
        "assistant" => Ok(Some(AgentEvent::Assistant {
            blocks: wire.content,
        })),
        "result" => {
            let result: TurnResult = serde_json::from_value(wire.rest)
                .map_err(|e| AgentError::Parse(format!("bad result event: {e}")))?;
            Ok(Some(AgentEvent::Result(result)))
        }
        _ => Ok(None),
    }
}
