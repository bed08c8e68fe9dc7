use serde::{Deserialize, Serialize};
use tracing::warn;

/// Where the agent found (or failed to find) the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerSource {
    #[serde(rename = "FAQ")]
    Faq,
    #[serde(rename = "knowledge_base")]
    KnowledgeBase,
    #[serde(rename = "expert")]
    Expert,
    #[serde(rename = "none")]
    None,
}

/// The session outcome the agent reports for this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    Active,
    Resolved,
}

/// Structured per-turn outcome embedded in the agent's last text payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetadata {
    pub key_points: Vec<String>,
    pub answer_source: AnswerSource,
    pub session_status: ReportedStatus,
    pub confidence: Option<f64>,
    pub expert_routed: Option<bool>,
    pub expert_user_id: Option<String>,
    pub domain: Option<String>,
    pub expert_name: Option<String>,
    pub original_question: Option<String>,
}

/// Find the first fenced metadata block, parse it, and strip it from the
/// user-visible text.
///
/// Blocks tagged ```` ```metadata ```` are always stripped: they are
/// never meant for the user, parseable or not. Blocks tagged
/// ```` ```json ```` are stripped only when they parse into valid
/// metadata, so ordinary JSON examples in an answer survive.
pub fn extract_metadata(text: &str) -> (String, Option<TurnMetadata>) {
    let mut search_from = 0;

    while let Some(block) = next_fenced_block(text, search_from) {
        let parsed: Option<TurnMetadata> = serde_json::from_str(block.body.trim()).ok();

        match (block.tag, parsed) {
            ("metadata", Some(metadata)) => {
                return (strip_range(text, block.start, block.end), Some(metadata));
            }
            ("metadata", None) => {
                warn!("unparseable metadata block stripped from response");
                return (strip_range(text, block.start, block.end), None);
            }
            ("json", Some(metadata)) => {
                return (strip_range(text, block.start, block.end), Some(metadata));
            }
            // A json block that is not turn metadata is real content.
            _ => search_from = block.end,
        }
    }

    (text.to_string(), None)
}

struct FencedBlock<'a> {
    tag: &'a str,
    body: &'a str,
    /// Byte offsets of the whole fence in the original text.
    start: usize,
    end: usize,
}

fn next_fenced_block(text: &str, from: usize) -> Option<FencedBlock<'_>> {
    let hay = &text[from..];
    let (tag, rel_start) = ["```metadata", "```json"]
        .iter()
        .filter_map(|fence| hay.find(fence).map(|pos| (&fence[3..], pos)))
        .min_by_key(|(_, pos)| *pos)?;

    let start = from + rel_start;
    let body_start = start + 3 + tag.len();
    let body_rel_end = text[body_start..].find("```")?;
    let body = &text[body_start..body_start + body_rel_end];
    let end = body_start + body_rel_end + 3;

    Some(FencedBlock {
        tag,
        body,
        start,
        end,
    })
}

fn strip_range(text: &str, start: usize, end: usize) -> String {
    let mut out = String::with_capacity(text.len());
    out.push_str(text[..start].trim_end());
    let tail = text[end..].trim_start();
    if !out.is_empty() && !tail.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(tail);
    out
}
