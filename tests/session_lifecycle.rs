//! Integration tests for turn injection, closure, and the subprocess pipeline
//!
//! These exercise the real concurrent boundary: an injecting caller racing
//! a consuming backend loop over the turn queue, and a live subprocess
//! feeding the normalizer through the transport.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_pending, assert_ready_eq};
use tokio_util::sync::CancellationToken;

use provider_session::normalize::turn::{ThreadEvent, TurnNormalizer};
use provider_session::{
    CanonicalMessage, ProcessSpec, RunHandle, SubprocessTransport, Transport, TurnInput, TurnQueue,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "provider_session=debug".into()),
        )
        .try_init();
}

// ============================================================================
// Queue ordering and closure
// ============================================================================

#[tokio::test]
async fn test_injection_before_consumption_follows_seed_prompt() {
    // The seed prompt is pushed before the backend exists; an injection
    // arriving immediately after the handle callback must be the very next
    // turn the backend observes.
    let queue = Arc::new(TurnQueue::new());
    queue.push(TurnInput::text("seed prompt"));

    let handle = RunHandle::new(Arc::clone(&queue), CancellationToken::new());
    handle.inject("follow-up", Vec::new());

    assert_eq!(queue.next().await, Some(TurnInput::text("seed prompt")));
    assert_eq!(queue.next().await, Some(TurnInput::text("follow-up")));
}

#[tokio::test]
async fn test_injection_races_consumption_without_loss() {
    let queue = Arc::new(TurnQueue::new());
    let total = 50u32;

    let consumer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(turn) = queue.next().await {
                seen.push(turn.text);
            }
            seen
        })
    };

    for i in 0..total {
        queue.push(TurnInput::text(format!("turn {i}")));
        if i % 7 == 0 {
            // Give the consumer a chance to park between pushes
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    queue.close();

    let seen = consumer.await.unwrap();
    assert_eq!(seen.len(), total as usize);
    // No loss and no reordering
    for (i, text) in seen.iter().enumerate() {
        assert_eq!(text, &format!("turn {i}"));
    }
}

#[test]
fn test_consumer_parks_until_injection_arrives() {
    let queue = Arc::new(TurnQueue::new());

    let mut next = tokio_test::task::spawn({
        let queue = Arc::clone(&queue);
        async move { queue.next().await }
    });
    assert_pending!(next.poll());

    queue.push(TurnInput::text("wake up"));
    assert!(next.is_woken());
    assert_ready_eq!(next.poll(), Some(TurnInput::text("wake up")));
}

#[tokio::test]
async fn test_close_resolves_waiting_consumer() {
    let queue = Arc::new(TurnQueue::new());
    let handle = RunHandle::new(Arc::clone(&queue), CancellationToken::new());

    let consumer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.next().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    handle.close();
    let got = tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .expect("consumer must resolve after close")
        .unwrap();
    assert_eq!(got, None);
    assert!(!handle.is_active());
}

// ============================================================================
// Subprocess pipeline: scripted backend through transport and normalizer
// ============================================================================

fn scripted_backend(script: &str) -> ProcessSpec {
    ProcessSpec {
        program: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), script.to_string()],
        env: HashMap::new(),
        cwd: None,
    }
}

#[tokio::test]
async fn test_scripted_turn_stream_normalizes_end_to_end() -> anyhow::Result<()> {
    init_tracing();
    // A fake turn-based backend that emits one full turn and exits.
    let script = r#"
printf '%s\n' '{"type":"thread.started","thread_id":"t9"}'
printf '%s\n' '{"type":"turn.started"}'
printf '%s\n' '{"type":"item.started","item":{"id":"a1","item_type":"agent_message","text":""}}'
printf '%s\n' '{"type":"item.completed","item":{"id":"a1","item_type":"agent_message","text":"hi there"}}'
printf '%s\n' '{"type":"turn.completed","usage":{"input_tokens":5,"output_tokens":2,"cached_input_tokens":0}}'
"#;

    let mut transport =
        SubprocessTransport::new(scripted_backend(script), CancellationToken::new())?;
    transport.connect().await?;
    let mut rx = transport.read_messages();

    let mut normalizer = TurnNormalizer::new(None);
    let mut out = Vec::new();
    while let Some(item) = rx.recv().await {
        let event: ThreadEvent = serde_json::from_value(item?)?;
        out.extend(normalizer.handle(event));
    }
    transport.close().await?;

    // init, start, delta, stop, assistant, result
    assert_eq!(out.len(), 6);
    assert!(matches!(&out[0], CanonicalMessage::System { session_id, .. }
        if session_id.as_deref() == Some("t9")));
    assert!(matches!(&out[4], CanonicalMessage::Assistant { .. }));
    match out.last().unwrap() {
        CanonicalMessage::Result {
            result,
            usage,
            session_id,
            is_error,
            ..
        } => {
            assert_eq!(result.as_deref(), Some("hi there"));
            assert_eq!(usage.as_ref().unwrap().input_tokens, 5);
            assert_eq!(session_id.as_deref(), Some("t9"));
            assert!(!*is_error);
        }
        other => panic!("expected result, got {other:?}"),
    }

    assert_eq!(normalizer.last_agent_message(), Some("hi there"));
    assert_eq!(normalizer.thread_id(), Some("t9"));
    Ok(())
}

#[tokio::test]
async fn test_abort_stops_scripted_backend_quietly() {
    // Backend hangs after its first event; aborting must end the stream
    // without surfacing an error message.
    let script = r#"
printf '%s\n' '{"type":"thread.started","thread_id":"t1"}'
sleep 30
"#;
    let cancel = CancellationToken::new();
    let mut transport =
        SubprocessTransport::new(scripted_backend(script), cancel.clone()).unwrap();
    transport.connect().await.unwrap();
    let mut rx = transport.read_messages();

    let first = rx.recv().await.unwrap().unwrap();
    assert_eq!(first["type"], "thread.started");

    cancel.cancel();
    let end = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("stream must end promptly after abort");
    // Either clean EOF or a kill without exit-code error; never hangs
    assert!(end.is_none() || end.unwrap().is_err());
    transport.close().await.unwrap();
}
