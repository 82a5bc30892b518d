//! Normalization of the turn-based backend's event vocabulary
//!
//! The turn-based SDK emits structured thread events: `item.*` lifecycle
//! events with typed payloads, `turn.*` envelopes, and a thread-identity
//! event. This module maps that vocabulary onto the canonical streaming
//! protocol. Incremental items (agent message, reasoning) become real
//! content-block streams; atomic items (a completed command, file change,
//! sub-tool call, web search) are framed as degenerate
//! start→delta→stop triplets followed by a `tool_result`, because the
//! canonical protocol has no concept of an atomic tool call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::protocol::{
    CanonicalMessage, ContentBlock, Delta, ResultSubtype, StreamEvent, ToolResultContent, Usage,
};

/// Completion status of a thread item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Still running
    #[default]
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

/// One change within a file-change item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUpdateChange {
    /// Path the change applies to
    pub path: String,
    /// Change kind
    pub kind: FileChangeKind,
}

/// Kind of a single file change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    /// A new file was added
    Add,
    /// An existing file was deleted
    Delete,
    /// An existing file was modified
    Update,
}

/// One entry of a todo-list item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    /// Task description
    pub text: String,
    /// Whether the task is done
    #[serde(default)]
    pub completed: bool,
}

/// Typed payload of a thread item
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "item_type", rename_all = "snake_case")]
pub enum ThreadItemDetails {
    /// Incremental assistant prose
    AgentMessage {
        /// Full text so far (grows monotonically across updates)
        #[serde(default)]
        text: String,
    },
    /// Incremental model reasoning
    Reasoning {
        /// Full reasoning text so far
        #[serde(default)]
        text: String,
    },
    /// A shell command execution
    CommandExecution {
        /// The command line
        command: String,
        /// Captured stdout+stderr
        #[serde(default)]
        aggregated_output: String,
        /// Exit code once finished
        #[serde(default)]
        exit_code: Option<i32>,
        /// Completion status
        #[serde(default)]
        status: ItemStatus,
    },
    /// A set of file modifications
    FileChange {
        /// The individual changes
        #[serde(default)]
        changes: Vec<FileUpdateChange>,
        /// Completion status
        #[serde(default)]
        status: ItemStatus,
    },
    /// A call into an auxiliary tool server
    McpToolCall {
        /// Tool server name
        server: String,
        /// Tool name on that server
        tool: String,
        /// Completion status
        #[serde(default)]
        status: ItemStatus,
    },
    /// A web search
    WebSearch {
        /// The search query
        query: String,
    },
    /// The agent's running task list
    TodoList {
        /// Current entries
        #[serde(default)]
        items: Vec<TodoItem>,
    },
    /// A backend-reported item-level error
    Error {
        /// Error description
        message: String,
    },
}

/// A thread item: id plus typed payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadItem {
    /// Item id, stable across started/updated/completed
    pub id: String,
    /// Typed payload
    #[serde(flatten)]
    pub details: ThreadItemDetails,
}

/// Turn-level failure payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadError {
    /// Error description
    pub message: String,
}

/// Native events emitted by the turn-based backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ThreadEvent {
    /// Thread identity, first event of a session
    #[serde(rename = "thread.started")]
    ThreadStarted {
        /// Backend thread id
        thread_id: String,
    },
    /// A turn began
    #[serde(rename = "turn.started")]
    TurnStarted,
    /// A turn finished successfully
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        /// Token usage for the turn
        #[serde(default)]
        usage: Usage,
    },
    /// A turn failed
    #[serde(rename = "turn.failed")]
    TurnFailed {
        /// Failure payload
        error: ThreadError,
    },
    /// An item appeared
    #[serde(rename = "item.started")]
    ItemStarted {
        /// The item
        item: ThreadItem,
    },
    /// An item's payload grew or changed
    #[serde(rename = "item.updated")]
    ItemUpdated {
        /// The item
        item: ThreadItem,
    },
    /// An item finished
    #[serde(rename = "item.completed")]
    ItemCompleted {
        /// The item
        item: ThreadItem,
    },
    /// A stream-level error
    #[serde(rename = "error")]
    Error {
        /// Error description
        message: String,
    },
}

/// Stateful normalizer for one turn-based session
///
/// Guarantees the canonical block-lifecycle invariants: a block is always
/// closed before another opens, deltas carry only text not yet emitted, and
/// `tool_result` messages follow their `tool_use` within the same batch.
#[derive(Default)]
pub struct TurnNormalizer {
    thread_id: Option<String>,
    model: Option<String>,
    init_emitted: bool,
    /// Id of the currently open content block, if any
    open_block: Option<String>,
    /// Bytes already emitted per incremental item id
    emitted_bytes: HashMap<String, usize>,
    last_agent_message: Option<String>,
    usage: Usage,
}

impl TurnNormalizer {
    /// Create a normalizer; `model` is included in the init message
    #[must_use]
    pub fn new(model: Option<String>) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    /// Thread id observed so far
    #[must_use]
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    /// Last fully materialized agent message text
    #[must_use]
    pub fn last_agent_message(&self) -> Option<&str> {
        self.last_agent_message.as_deref()
    }

    /// Aggregate usage across completed turns
    #[must_use]
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Map one native event onto zero or more canonical messages
    pub fn handle(&mut self, event: ThreadEvent) -> Vec<CanonicalMessage> {
        let mut out = Vec::new();
        match event {
            ThreadEvent::ThreadStarted { thread_id } => {
                self.thread_id = Some(thread_id.clone());
                if !self.init_emitted {
                    self.init_emitted = true;
                    out.push(CanonicalMessage::init(Some(thread_id), self.model.clone()));
                }
            }
            ThreadEvent::TurnStarted => {}
            ThreadEvent::TurnCompleted { usage } => {
                self.close_open_block(&mut out);
                self.usage.add(&usage);
                out.push(CanonicalMessage::Result {
                    subtype: ResultSubtype::Success,
                    result: self.last_agent_message.clone(),
                    usage: Some(usage),
                    total_cost_usd: None,
                    session_id: self.thread_id.clone(),
                    is_error: false,
                });
            }
            ThreadEvent::TurnFailed { error } => {
                self.close_open_block(&mut out);
                // No distinct "turn failed" message kind exists downstream;
                // failure travels as an error-flagged result.
                let text = self
                    .last_agent_message
                    .clone()
                    .unwrap_or_else(|| format!("Turn failed: {}", error.message));
                out.push(CanonicalMessage::Result {
                    subtype: ResultSubtype::ErrorDuringExecution,
                    result: Some(text),
                    usage: None,
                    total_cost_usd: None,
                    session_id: self.thread_id.clone(),
                    is_error: true,
                });
            }
            ThreadEvent::ItemStarted { item } | ThreadEvent::ItemUpdated { item } => {
                self.handle_item(item, false, &mut out);
            }
            ThreadEvent::ItemCompleted { item } => {
                self.handle_item(item, true, &mut out);
            }
            ThreadEvent::Error { message } => {
                self.close_open_block(&mut out);
                out.push(CanonicalMessage::Error { message });
            }
        }
        out
    }

    fn handle_item(&mut self, item: ThreadItem, completed: bool, out: &mut Vec<CanonicalMessage>) {
        match item.details {
            ThreadItemDetails::AgentMessage { text } => {
                self.stream_text(&item.id, &text, completed, false, out);
                if completed {
                    self.last_agent_message = Some(text.clone());
                    out.push(CanonicalMessage::Assistant {
                        content: vec![ContentBlock::Text { text }],
                    });
                }
            }
            ThreadItemDetails::Reasoning { text } => {
                self.stream_text(&item.id, &text, completed, true, out);
            }
            ThreadItemDetails::CommandExecution {
                command,
                aggregated_output,
                exit_code,
                status,
            } => {
                if completed {
                    let is_error =
                        status == ItemStatus::Failed || exit_code.is_some_and(|c| c != 0);
                    self.atomic_tool(
                        &item.id,
                        "shell",
                        serde_json::json!({ "command": command }),
                        Some(ToolResultContent::Text(aggregated_output)),
                        is_error,
                        out,
                    );
                }
            }
            ThreadItemDetails::FileChange { changes, status } => {
                if completed {
                    // A single pure addition is a create; anything else is an edit.
                    let name = if changes.len() == 1 && changes[0].kind == FileChangeKind::Add {
                        "create"
                    } else {
                        "edit"
                    };
                    let payload = serde_json::json!({ "changes": changes });
                    self.atomic_tool(
                        &item.id,
                        name,
                        payload.clone(),
                        Some(ToolResultContent::Json(payload)),
                        status == ItemStatus::Failed,
                        out,
                    );
                }
            }
            ThreadItemDetails::McpToolCall {
                server,
                tool,
                status,
            } => {
                if completed {
                    self.atomic_tool(
                        &item.id,
                        "mcp_tool_call",
                        serde_json::json!({ "server": server, "tool": tool }),
                        Some(ToolResultContent::Json(
                            serde_json::json!({ "server": server, "tool": tool, "status": status }),
                        )),
                        status == ItemStatus::Failed,
                        out,
                    );
                }
            }
            ThreadItemDetails::WebSearch { query } => {
                if completed {
                    self.atomic_tool(
                        &item.id,
                        "web_search",
                        serde_json::json!({ "query": query }),
                        Some(ToolResultContent::Json(serde_json::json!({ "query": query }))),
                        false,
                        out,
                    );
                }
            }
            ThreadItemDetails::TodoList { items } => {
                if completed {
                    let payload = serde_json::json!({ "items": items });
                    self.atomic_tool(
                        &item.id,
                        "todo_list",
                        payload.clone(),
                        Some(ToolResultContent::Json(payload)),
                        false,
                        out,
                    );
                }
            }
            ThreadItemDetails::Error { message } => {
                self.close_open_block(out);
                out.push(CanonicalMessage::Error { message });
            }
        }
    }

    /// Stream incremental text for an item: open on first sight, emit only
    /// the suffix not yet sent, close on completion
    fn stream_text(
        &mut self,
        id: &str,
        text: &str,
        completed: bool,
        thinking: bool,
        out: &mut Vec<CanonicalMessage>,
    ) {
        self.ensure_block(
            id,
            if thinking {
                ContentBlock::Thinking {
                    thinking: String::new(),
                }
            } else {
                ContentBlock::Text {
                    text: String::new(),
                }
            },
            out,
        );

        let already = self.emitted_bytes.get(id).copied().unwrap_or(0);
        // `get` instead of slicing: a backend that rewrites instead of
        // appending must not be able to panic us on a char boundary.
        if let Some(suffix) = (text.len() > already)
            .then(|| text.get(already..))
            .flatten()
        {
            let suffix = suffix.to_string();
            self.emitted_bytes.insert(id.to_string(), text.len());
            let delta = if thinking {
                Delta::ThinkingDelta {
                    thinking: suffix,
                }
            } else {
                Delta::TextDelta { text: suffix }
            };
            out.push(CanonicalMessage::Stream {
                event: StreamEvent::ContentBlockDelta {
                    id: id.to_string(),
                    delta,
                },
            });
        }

        if completed {
            out.push(CanonicalMessage::Stream {
                event: StreamEvent::ContentBlockStop { id: id.to_string() },
            });
            self.open_block = None;
            self.emitted_bytes.remove(id);
        }
    }

    /// Emit a degenerate start→delta→stop triplet plus the tool result
    fn atomic_tool(
        &mut self,
        id: &str,
        name: &str,
        input: serde_json::Value,
        content: Option<ToolResultContent>,
        is_error: bool,
        out: &mut Vec<CanonicalMessage>,
    ) {
        self.close_open_block(out);

        out.push(CanonicalMessage::Stream {
            event: StreamEvent::ContentBlockStart {
                id: id.to_string(),
                block: ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: input.clone(),
                },
            },
        });
        out.push(CanonicalMessage::Stream {
            event: StreamEvent::ContentBlockDelta {
                id: id.to_string(),
                delta: Delta::InputJsonDelta {
                    partial_json: input.to_string(),
                },
            },
        });
        out.push(CanonicalMessage::Stream {
            event: StreamEvent::ContentBlockStop { id: id.to_string() },
        });

        out.push(CanonicalMessage::ToolResult {
            tool_use_id: id.to_string(),
            content,
            is_error,
        });
    }

    /// Open a block for `id` unless it is already the open one; any other
    /// open block is closed first so starts never interleave
    fn ensure_block(&mut self, id: &str, block: ContentBlock, out: &mut Vec<CanonicalMessage>) {
        if self.open_block.as_deref() == Some(id) {
            return;
        }
        self.close_open_block(out);
        self.open_block = Some(id.to_string());
        out.push(CanonicalMessage::Stream {
            event: StreamEvent::ContentBlockStart {
                id: id.to_string(),
                block,
            },
        });
    }

    fn close_open_block(&mut self, out: &mut Vec<CanonicalMessage>) {
        if let Some(id) = self.open_block.take() {
            out.push(CanonicalMessage::Stream {
                event: StreamEvent::ContentBlockStop { id },
            });
        }
    }
}
