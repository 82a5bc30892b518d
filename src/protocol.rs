//! Canonical streaming message protocol
//!
//! Every backend's native event vocabulary is normalized onto this one schema.
//! Downstream consumers (UI, persistence, notification dispatch) only ever see
//! these shapes, never a backend-specific event.
//!
//! Two invariants hold for every normalized stream:
//! - every `content_block_start` for a block id is followed by zero or more
//!   deltas and exactly one `content_block_stop` before a block with a new id
//!   may start
//! - a `tool_result` never references a tool-use id that has not been emitted

use serde::{Deserialize, Serialize};

/// Token usage for a turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed from the prompt
    #[serde(default)]
    pub input_tokens: u64,
    /// Tokens generated by the model
    #[serde(default)]
    pub output_tokens: u64,
    /// Prompt tokens served from cache
    #[serde(default)]
    pub cached_input_tokens: u64,
}

impl Usage {
    /// Accumulate another usage record into this one
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
    }
}

/// Content block types carried inside stream events and assistant messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text content block
    Text {
        /// Text content
        text: String,
    },
    /// Thinking content block (model reasoning)
    Thinking {
        /// Thinking content
        thinking: String,
    },
    /// Tool invocation request
    ToolUse {
        /// Tool use ID
        id: String,
        /// Tool name
        name: String,
        /// Tool input parameters
        input: serde_json::Value,
    },
}

/// Incremental content carried by a `content_block_delta`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    /// Text growth
    TextDelta {
        /// Appended text
        text: String,
    },
    /// Thinking growth
    ThinkingDelta {
        /// Appended thinking text
        thinking: String,
    },
    /// Partial tool input JSON
    InputJsonDelta {
        /// Appended raw JSON fragment
        partial_json: String,
    },
}

/// Content-block lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A new content block opened
    ContentBlockStart {
        /// Block id, unique within the stream
        id: String,
        /// The opening block (text/thinking blocks start empty)
        block: ContentBlock,
    },
    /// Incremental growth of the open block
    ContentBlockDelta {
        /// Block id this delta belongs to
        id: String,
        /// The incremental content
        delta: Delta,
    },
    /// The block closed; no further deltas for this id
    ContentBlockStop {
        /// Block id
        id: String,
    },
}

impl StreamEvent {
    /// The block id this event refers to
    #[must_use]
    pub fn block_id(&self) -> &str {
        match self {
            StreamEvent::ContentBlockStart { id, .. }
            | StreamEvent::ContentBlockDelta { id, .. }
            | StreamEvent::ContentBlockStop { id } => id,
        }
    }
}

/// Result content attached to a tool-use id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    /// Plain text outcome
    Text(String),
    /// Structured outcome
    Json(serde_json::Value),
}

/// Terminal per-turn outcome subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    /// The turn completed normally
    Success,
    /// The backend reported a failed turn
    ErrorDuringExecution,
    /// The turn was aborted by the caller
    Aborted,
}

/// The normalized protocol unit emitted by `query()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalMessage {
    /// Session identity, emitted once at session start
    System {
        /// System subtype (currently always "init")
        subtype: String,
        /// Backend session/thread identifier
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Active model
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// Content-block lifecycle event
    Stream {
        /// The lifecycle event
        event: StreamEvent,
    },
    /// Fully materialized assistant message, emitted once a block closes
    Assistant {
        /// Message content blocks
        content: Vec<ContentBlock>,
    },
    /// Tool outcome, keyed to a previously emitted tool-use id
    ToolResult {
        /// Id of the tool use this result belongs to
        tool_use_id: String,
        /// Result payload
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        /// Whether the tool invocation failed
        #[serde(default)]
        is_error: bool,
    },
    /// Terminal per-turn outcome
    Result {
        /// Outcome subtype
        subtype: ResultSubtype,
        /// Final text (last agent message, or synthesized error string)
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        /// Aggregate token usage for the turn
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        /// Total cost in USD, when the backend reports it
        #[serde(skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
        /// Backend session identifier
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Whether the turn failed
        #[serde(default)]
        is_error: bool,
    },
    /// Non-turn error surfaced as data within the stream
    Error {
        /// Human-readable error description
        message: String,
    },
}

impl CanonicalMessage {
    /// Convenience constructor for the session init message
    #[must_use]
    pub fn init(session_id: Option<String>, model: Option<String>) -> Self {
        CanonicalMessage::System {
            subtype: "init".to_string(),
            session_id,
            model,
        }
    }

    /// True for terminal result messages (the turn is over)
    #[must_use]
    pub fn is_turn_result(&self) -> bool {
        matches!(self, CanonicalMessage::Result { .. })
    }
}

/// Final summary returned to callers after the stream is fully drained
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuerySummary {
    /// Final assistant text of the last turn
    pub result_text: Option<String>,
    /// Backend session identifier, for resumption
    pub session_id: Option<String>,
    /// Aggregate usage across the whole query
    pub usage: Usage,
    /// Total cost in USD, when reported
    pub total_cost_usd: Option<f64>,
}
