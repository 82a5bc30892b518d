//! Integration tests for the protocol invariants both normalizers must hold
//!
//! Every normalized stream must satisfy two properties regardless of which
//! backend produced it: block lifecycles never interleave (start, deltas,
//! exactly one stop per id), and a tool_result never precedes the tool_use
//! it references.

use std::collections::HashSet;

use provider_session::normalize::stream::StreamNormalizer;
use provider_session::normalize::turn::{
    FileChangeKind, FileUpdateChange, ItemStatus, ThreadError, ThreadEvent, ThreadItem,
    ThreadItemDetails, TurnNormalizer,
};
use provider_session::{CanonicalMessage, ContentBlock, StreamEvent, Usage};

// ============================================================================
// Invariant checker
// ============================================================================

/// Walks a canonical message sequence and panics on any invariant violation
fn assert_stream_invariants(messages: &[CanonicalMessage]) {
    let mut open_block: Option<String> = None;
    let mut tool_uses: HashSet<String> = HashSet::new();

    for message in messages {
        match message {
            CanonicalMessage::Stream { event } => match event {
                StreamEvent::ContentBlockStart { id, block } => {
                    // A second start for any id requires an intervening stop
                    assert!(
                        open_block.is_none(),
                        "block {id} started while {open_block:?} is still open"
                    );
                    open_block = Some(id.clone());
                    if let ContentBlock::ToolUse { id: tool_id, .. } = block {
                        tool_uses.insert(tool_id.clone());
                    }
                }
                StreamEvent::ContentBlockDelta { id, .. } => {
                    assert_eq!(
                        open_block.as_ref(),
                        Some(id),
                        "delta for {id} outside its open block"
                    );
                }
                StreamEvent::ContentBlockStop { id } => {
                    // Exactly one stop closes each start
                    assert_eq!(
                        open_block.as_ref(),
                        Some(id),
                        "stop for {id} without matching start"
                    );
                    open_block = None;
                }
            },
            CanonicalMessage::ToolResult { tool_use_id, .. } => {
                assert!(
                    tool_uses.contains(tool_use_id),
                    "tool_result for {tool_use_id} before its tool_use"
                );
            }
            _ => {}
        }
    }
    assert!(open_block.is_none(), "stream ended with {open_block:?} open");
}

fn agent(id: &str, text: &str) -> ThreadItem {
    ThreadItem {
        id: id.to_string(),
        details: ThreadItemDetails::AgentMessage {
            text: text.to_string(),
        },
    }
}

// ============================================================================
// Turn-based backend
// ============================================================================

#[test]
fn test_turn_normalizer_holds_invariants_across_a_busy_turn() {
    let mut n = TurnNormalizer::new(Some("gpt-5-codex".to_string()));
    let mut out = Vec::new();

    let events = vec![
        ThreadEvent::ThreadStarted {
            thread_id: "t1".to_string(),
        },
        ThreadEvent::TurnStarted,
        ThreadEvent::ItemStarted {
            item: ThreadItem {
                id: "r1".to_string(),
                details: ThreadItemDetails::Reasoning {
                    text: "Let me look".to_string(),
                },
            },
        },
        ThreadEvent::ItemCompleted {
            item: ThreadItem {
                id: "r1".to_string(),
                details: ThreadItemDetails::Reasoning {
                    text: "Let me look at the files first".to_string(),
                },
            },
        },
        ThreadEvent::ItemCompleted {
            item: ThreadItem {
                id: "c1".to_string(),
                details: ThreadItemDetails::CommandExecution {
                    command: "ls src".to_string(),
                    aggregated_output: "lib.rs\nmain.rs\n".to_string(),
                    exit_code: Some(0),
                    status: ItemStatus::Completed,
                },
            },
        },
        ThreadEvent::ItemStarted {
            item: agent("a1", "There are "),
        },
        // A file change lands while the agent message is mid-stream
        ThreadEvent::ItemCompleted {
            item: ThreadItem {
                id: "f1".to_string(),
                details: ThreadItemDetails::FileChange {
                    changes: vec![FileUpdateChange {
                        path: "src/new.rs".to_string(),
                        kind: FileChangeKind::Add,
                    }],
                    status: ItemStatus::Completed,
                },
            },
        },
        ThreadEvent::ItemUpdated {
            item: agent("a1", "There are two files"),
        },
        ThreadEvent::ItemCompleted {
            item: agent("a1", "There are two files in src"),
        },
        ThreadEvent::TurnCompleted {
            usage: Usage {
                input_tokens: 40,
                output_tokens: 12,
                cached_input_tokens: 0,
            },
        },
    ];

    for event in events {
        out.extend(n.handle(event));
    }

    assert_stream_invariants(&out);

    // The turn ends in a successful result carrying the final text
    match out.last().unwrap() {
        CanonicalMessage::Result {
            result, is_error, ..
        } => {
            assert_eq!(result.as_deref(), Some("There are two files in src"));
            assert!(!*is_error);
        }
        other => panic!("expected result, got {other:?}"),
    }
}

#[test]
fn test_turn_normalizer_holds_invariants_on_failure_mid_block() {
    let mut n = TurnNormalizer::new(None);
    let mut out = Vec::new();
    out.extend(n.handle(ThreadEvent::ItemStarted {
        item: agent("a1", "partial"),
    }));
    out.extend(n.handle(ThreadEvent::TurnFailed {
        error: ThreadError {
            message: "connection reset".to_string(),
        },
    }));

    assert_stream_invariants(&out);
    assert!(matches!(
        out.last(),
        Some(CanonicalMessage::Result { is_error: true, .. })
    ));
}

#[test]
fn test_started_then_completed_emits_single_delta() {
    // item.started(agent_message, id=1) then item.completed(text="hello")
    // must yield start, one delta "hello", stop, assistant("hello").
    let mut n = TurnNormalizer::new(None);
    let mut out = n.handle(ThreadEvent::ItemStarted {
        item: agent("1", ""),
    });
    out.extend(n.handle(ThreadEvent::ItemCompleted {
        item: agent("1", "hello"),
    }));

    assert_stream_invariants(&out);

    let deltas: Vec<_> = out
        .iter()
        .filter(|m| {
            matches!(
                m,
                CanonicalMessage::Stream {
                    event: StreamEvent::ContentBlockDelta { .. }
                }
            )
        })
        .collect();
    assert_eq!(deltas.len(), 1);
    assert!(matches!(
        out.last(),
        Some(CanonicalMessage::Assistant { content })
            if content == &vec![ContentBlock::Text { text: "hello".to_string() }]
    ));
}

// ============================================================================
// Streaming backend
// ============================================================================

#[test]
fn test_stream_normalizer_holds_invariants_over_wire_lines() {
    let lines = [
        r#"{"type":"system","subtype":"init","session_id":"s1","model":"claude-sonnet-4-5"}"#,
        r#"{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}}"#,
        r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Looking"}}}"#,
        r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" now"}}}"#,
        r#"{"type":"stream_event","event":{"type":"content_block_stop","index":0}}"#,
        r#"{"type":"stream_event","event":{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"bash","input":{}}}}"#,
        r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"command\":\"ls\"}"}}}"#,
        r#"{"type":"stream_event","event":{"type":"content_block_stop","index":1}}"#,
        r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"a.rs","is_error":false}]}}"#,
        r#"{"type":"result","subtype":"success","result":"done","usage":{"input_tokens":9,"output_tokens":4},"session_id":"s1","is_error":false}"#,
    ];

    let mut n = StreamNormalizer::new();
    let mut out = Vec::new();
    for line in lines {
        out.extend(n.handle(StreamNormalizer::parse_line(line).unwrap()));
    }

    assert_stream_invariants(&out);

    let summary = n.summary();
    assert_eq!(summary.result_text.as_deref(), Some("done"));
    assert_eq!(summary.session_id.as_deref(), Some("s1"));
    assert_eq!(summary.usage.input_tokens, 9);
}
