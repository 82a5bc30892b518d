//! Normalization of the token-streaming backend's wire protocol
//!
//! This backend already speaks a content-block stream, so normalization is
//! mostly passthrough: re-key numeric block indices to stable string ids,
//! fold its usage shape into the canonical one, and keep enough bookkeeping
//! to produce the final [`QuerySummary`] once the stream is drained.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{
    CanonicalMessage, ContentBlock, Delta, QuerySummary, ResultSubtype, StreamEvent,
    ToolResultContent, Usage,
};

/// Usage as the streaming CLI reports it
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NativeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

impl From<NativeUsage> for Usage {
    fn from(native: NativeUsage) -> Self {
        Usage {
            input_tokens: native.input_tokens,
            output_tokens: native.output_tokens,
            cached_input_tokens: native.cache_read_input_tokens,
        }
    }
}

/// Raw stream events as emitted on the wire, indexed by block position
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NativeEvent {
    /// A content block opened at `index`
    ContentBlockStart {
        /// Block position within the message
        index: usize,
        /// The raw opening block
        content_block: serde_json::Value,
    },
    /// Incremental growth of the block at `index`
    ContentBlockDelta {
        /// Block position within the message
        index: usize,
        /// The incremental content
        delta: Delta,
    },
    /// The block at `index` closed
    ContentBlockStop {
        /// Block position within the message
        index: usize,
    },
    /// Message-level framing we do not re-emit
    #[serde(other)]
    Other,
}

/// Inner message payload carried by assistant/user lines
#[derive(Debug, Clone, Deserialize)]
pub struct NativeMessage {
    #[serde(default)]
    content: Vec<serde_json::Value>,
}

/// One line of the streaming CLI's JSON output
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NativeStreamMessage {
    /// Session identity line
    System {
        /// System subtype ("init" at session start)
        subtype: String,
        /// Backend session identifier
        #[serde(default)]
        session_id: Option<String>,
        /// Active model
        #[serde(default)]
        model: Option<String>,
    },
    /// A raw content-block event
    StreamEvent {
        /// The wrapped event
        event: NativeEvent,
    },
    /// Materialized assistant message
    Assistant {
        /// The inner message payload
        message: NativeMessage,
    },
    /// User-side message, carries tool results
    User {
        /// The inner message payload
        message: NativeMessage,
    },
    /// Terminal per-turn outcome
    Result {
        /// Outcome subtype string
        subtype: String,
        /// Final text
        #[serde(default)]
        result: Option<String>,
        /// Usage for the turn
        #[serde(default)]
        usage: Option<NativeUsage>,
        /// Cost in USD, when reported
        #[serde(default)]
        total_cost_usd: Option<f64>,
        /// Backend session identifier
        #[serde(default)]
        session_id: Option<String>,
        /// Whether the turn failed
        #[serde(default)]
        is_error: bool,
    },
}

/// Stateful normalizer for one streaming session
#[derive(Default)]
pub struct StreamNormalizer {
    session_id: Option<String>,
    /// Stable id per currently-open block index
    open_blocks: HashMap<usize, String>,
    block_seq: u64,
    last_result_text: Option<String>,
    usage: Usage,
    total_cost_usd: Option<f64>,
}

impl StreamNormalizer {
    /// Create a normalizer with no session state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one line of backend output
    ///
    /// # Errors
    ///
    /// Returns a JSON error for lines that do not match the wire protocol.
    pub fn parse_line(line: &str) -> Result<NativeStreamMessage> {
        Ok(serde_json::from_str(line)?)
    }

    /// Session id observed so far
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Map one native message onto zero or more canonical messages
    pub fn handle(&mut self, message: NativeStreamMessage) -> Vec<CanonicalMessage> {
        match message {
            NativeStreamMessage::System {
                subtype,
                session_id,
                model,
            } => {
                if let Some(id) = &session_id {
                    self.session_id = Some(id.clone());
                }
                vec![CanonicalMessage::System {
                    subtype,
                    session_id,
                    model,
                }]
            }
            NativeStreamMessage::StreamEvent { event } => self.handle_event(event),
            NativeStreamMessage::Assistant { message } => {
                let content: Vec<ContentBlock> = message
                    .content
                    .into_iter()
                    .filter_map(|v| serde_json::from_value(v).ok())
                    .collect();
                if content.is_empty() {
                    Vec::new()
                } else {
                    vec![CanonicalMessage::Assistant { content }]
                }
            }
            NativeStreamMessage::User { message } => message
                .content
                .into_iter()
                .filter_map(tool_result_from_value)
                .collect(),
            NativeStreamMessage::Result {
                subtype,
                result,
                usage,
                total_cost_usd,
                session_id,
                is_error,
            } => {
                let usage: Option<Usage> = usage.map(Into::into);
                if let Some(u) = &usage {
                    self.usage.add(u);
                }
                if let Some(cost) = total_cost_usd {
                    self.total_cost_usd = Some(cost);
                }
                if let Some(id) = &session_id {
                    self.session_id = Some(id.clone());
                }
                if result.is_some() {
                    self.last_result_text = result.clone();
                }
                vec![CanonicalMessage::Result {
                    subtype: map_result_subtype(&subtype, is_error),
                    result,
                    usage,
                    total_cost_usd,
                    session_id: session_id.or_else(|| self.session_id.clone()),
                    is_error,
                }]
            }
        }
    }

    /// Summary of everything seen so far; call after the stream is drained
    #[must_use]
    pub fn summary(&self) -> QuerySummary {
        QuerySummary {
            result_text: self.last_result_text.clone(),
            session_id: self.session_id.clone(),
            usage: self.usage.clone(),
            total_cost_usd: self.total_cost_usd,
        }
    }

    fn handle_event(&mut self, event: NativeEvent) -> Vec<CanonicalMessage> {
        match event {
            NativeEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                // Tool-use blocks carry their own id; other kinds get a
                // synthesized one, stable until the matching stop.
                let id = content_block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        self.block_seq += 1;
                        format!("blk_{}", self.block_seq)
                    });
                self.open_blocks.insert(index, id.clone());
                let block: ContentBlock = serde_json::from_value(content_block)
                    .unwrap_or(ContentBlock::Text {
                        text: String::new(),
                    });
                vec![CanonicalMessage::Stream {
                    event: StreamEvent::ContentBlockStart { id, block },
                }]
            }
            NativeEvent::ContentBlockDelta { index, delta } => {
                let Some(id) = self.open_blocks.get(&index).cloned() else {
                    // Delta for a block we never saw start; drop it rather
                    // than violate the start-before-delta ordering.
                    tracing::warn!(index, "Dropping delta for unopened block");
                    return Vec::new();
                };
                vec![CanonicalMessage::Stream {
                    event: StreamEvent::ContentBlockDelta { id, delta },
                }]
            }
            NativeEvent::ContentBlockStop { index } => match self.open_blocks.remove(&index) {
                Some(id) => vec![CanonicalMessage::Stream {
                    event: StreamEvent::ContentBlockStop { id },
                }],
                None => Vec::new(),
            },
            NativeEvent::Other => Vec::new(),
        }
    }
}

fn map_result_subtype(subtype: &str, is_error: bool) -> ResultSubtype {
    match subtype {
        "success" => ResultSubtype::Success,
        "aborted" | "error_max_turns" => ResultSubtype::Aborted,
        _ if is_error => ResultSubtype::ErrorDuringExecution,
        _ => ResultSubtype::Success,
    }
}

fn tool_result_from_value(value: serde_json::Value) -> Option<CanonicalMessage> {
    let obj = value.as_object()?;
    if obj.get("type").and_then(|v| v.as_str()) != Some("tool_result") {
        return None;
    }
    let tool_use_id = obj.get("tool_use_id")?.as_str()?.to_string();
    let content = obj.get("content").map(|c| match c {
        serde_json::Value::String(s) => ToolResultContent::Text(s.clone()),
        other => ToolResultContent::Json(other.clone()),
    });
    let is_error = obj
        .get("is_error")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    Some(CanonicalMessage::ToolResult {
        tool_use_id,
        content,
        is_error,
    })
}
