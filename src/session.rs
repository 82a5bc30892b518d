//! Live session handle and turn injection channel
//!
//! At least one backend's native contract is one prompt in, one finished
//! turn out. To run a long-lived multi-turn conversation over it, the
//! session keeps its own pull-based sequence of turn inputs that the
//! backend consumes as if it were reading more user input from an open
//! connection. The queue/waiter pair is the one place in the crate touched
//! by two concurrent flows (the injecting caller and the consuming backend
//! loop), so the empty-queue case is a single-pending-waiter rendezvous
//! built on a oneshot handoff, never a counter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// One injected turn: prompt text plus attached file paths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnInput {
    /// The user's prompt text
    pub text: String,
    /// Paths of files attached to the turn
    pub attachments: Vec<String>,
}

impl TurnInput {
    /// Build a text-only turn
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

struct QueueState {
    queue: VecDeque<TurnInput>,
    /// At most one parked consumer, fulfilled by push or close
    waiter: Option<oneshot::Sender<Option<TurnInput>>>,
    closed: bool,
}

/// Unbounded turn queue with a single-waiter rendezvous
///
/// `push` either hands the payload straight to a parked consumer or
/// appends it; `next` pops or parks. `close` wakes a parked consumer with
/// `None` so the consuming loop can observe closure instead of hanging.
pub struct TurnQueue {
    state: Mutex<QueueState>,
}

impl TurnQueue {
    /// Create an empty, open queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                waiter: None,
                closed: false,
            }),
        }
    }

    /// Queue a turn, or deliver it directly to a waiting consumer
    ///
    /// Pushes after `close()` are dropped.
    pub fn push(&self, input: TurnInput) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            tracing::debug!("Dropping turn injected after close");
            return;
        }
        if let Some(waiter) = state.waiter.take() {
            // Receiver may have been dropped (consumer cancelled); requeue
            // so the input is not lost.
            if let Err(unsent) = waiter.send(Some(input)) {
                if let Some(input) = unsent {
                    state.queue.push_back(input);
                }
            }
        } else {
            state.queue.push_back(input);
        }
    }

    /// Wait for the next turn; `None` means the channel is closed
    pub async fn next(&self) -> Option<TurnInput> {
        let rx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(input) = state.queue.pop_front() {
                return Some(input);
            }
            if state.closed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            // Only one backend loop consumes; a stale waiter would mean two.
            debug_assert!(state.waiter.is_none());
            state.waiter = Some(tx);
            rx
        };
        // Sender dropped without sending only happens via close(), which
        // sends None explicitly first; treat a bare drop as closure too.
        rx.await.unwrap_or(None)
    }

    /// Close the channel and wake any parked consumer
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        if let Some(waiter) = state.waiter.take() {
            let _ = waiter.send(None);
        }
    }

    /// Whether `close()` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    /// Number of turns queued and not yet consumed
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }

    /// True when no turns are queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TurnQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A named auxiliary tool server and its current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolServerInfo {
    /// Server name as declared in the query options
    pub name: String,
    /// Whether the server is currently enabled
    pub enabled: bool,
}

/// Live mid-session controls a backend may expose
///
/// Implemented by backend session objects that support changing state while
/// a conversation is running.
#[async_trait]
pub trait SessionControls: Send + Sync {
    /// Interrupt the turn currently in flight
    async fn interrupt(&self) -> Result<()>;

    /// Switch the active model
    async fn set_model(&self, model: &str) -> Result<()>;

    /// Switch the permission/approval mode
    async fn set_permission_mode(&self, mode: &str) -> Result<()>;

    /// List auxiliary tool servers and their state
    async fn list_tool_servers(&self) -> Result<Vec<ToolServerInfo>>;

    /// Enable or disable one auxiliary tool server
    async fn set_tool_server_enabled(&self, name: &str, enabled: bool) -> Result<()>;
}

/// Handle to a running session, handed to the caller before streaming begins
///
/// The handle is created and given out before the backend's streaming call
/// is issued, so injection and aborting work even during the window before
/// the first event arrives. Control calls are best-effort passthroughs: if
/// the backend session object does not exist yet, they are no-ops.
#[derive(Clone)]
pub struct RunHandle {
    active: Arc<AtomicBool>,
    queue: Arc<TurnQueue>,
    controls: Arc<Mutex<Option<Arc<dyn SessionControls>>>>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// Create a handle over a shared queue and cancellation token
    #[must_use]
    pub fn new(queue: Arc<TurnQueue>, cancel: CancellationToken) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
            queue,
            controls: Arc::new(Mutex::new(None)),
            cancel,
        }
    }

    /// Whether the session has not yet been closed or aborted
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Inject a follow-up turn into the running session
    ///
    /// Safe to call at any time while the handle is active; the turn is
    /// delivered immediately if the backend is idle, queued otherwise.
    pub fn inject(&self, text: impl Into<String>, attachments: Vec<String>) {
        if !self.is_active() {
            tracing::debug!("Ignoring injection into inactive session");
            return;
        }
        self.queue.push(TurnInput {
            text: text.into(),
            attachments,
        });
    }

    /// Close the turn channel; the backend loop drains and exits cleanly
    pub fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.queue.close();
    }

    /// Abort the session: cancel the backend and unblock the turn channel
    pub fn abort(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.queue.close();
    }

    /// Cancellation token shared with the backend subprocess
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Attach the live backend controls once the session object exists
    pub fn attach_controls(&self, controls: Arc<dyn SessionControls>) {
        *self.controls.lock().unwrap_or_else(|e| e.into_inner()) = Some(controls);
    }

    fn controls(&self) -> Option<Arc<dyn SessionControls>> {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Interrupt the current turn; no-op when controls are not attached yet
    ///
    /// # Errors
    ///
    /// Propagates backend failures once controls are attached.
    pub async fn interrupt(&self) -> Result<()> {
        match self.controls() {
            Some(c) => c.interrupt().await,
            None => Ok(()),
        }
    }

    /// Change the active model mid-session; no-op before controls attach
    ///
    /// # Errors
    ///
    /// Propagates backend failures once controls are attached.
    pub async fn set_model(&self, model: &str) -> Result<()> {
        match self.controls() {
            Some(c) => c.set_model(model).await,
            None => Ok(()),
        }
    }

    /// Change the permission mode mid-session; no-op before controls attach
    ///
    /// # Errors
    ///
    /// Propagates backend failures once controls are attached.
    pub async fn set_permission_mode(&self, mode: &str) -> Result<()> {
        match self.controls() {
            Some(c) => c.set_permission_mode(mode).await,
            None => Ok(()),
        }
    }

    /// List auxiliary tool servers; empty before controls attach
    ///
    /// # Errors
    ///
    /// Propagates backend failures once controls are attached.
    pub async fn list_tool_servers(&self) -> Result<Vec<ToolServerInfo>> {
        match self.controls() {
            Some(c) => c.list_tool_servers().await,
            None => Ok(Vec::new()),
        }
    }

    /// Toggle one auxiliary tool server; no-op before controls attach
    ///
    /// # Errors
    ///
    /// Propagates backend failures once controls are attached.
    pub async fn set_tool_server_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        match self.controls() {
            Some(c) => c.set_tool_server_enabled(name, enabled).await,
            None => Ok(()),
        }
    }

    /// The shared turn queue, for the backend's consuming loop
    #[must_use]
    pub fn queue(&self) -> Arc<TurnQueue> {
        Arc::clone(&self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_push_before_next_is_not_lost() {
        let queue = TurnQueue::new();
        queue.push(TurnInput::text("first"));
        queue.push(TurnInput::text("second"));

        assert_eq!(queue.next().await, Some(TurnInput::text("first")));
        assert_eq!(queue.next().await, Some(TurnInput::text("second")));
    }

    #[tokio::test]
    async fn test_push_fulfills_parked_waiter() {
        let queue = Arc::new(TurnQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        // Let the consumer park itself
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(TurnInput::text("hello"));

        assert_eq!(consumer.await.unwrap(), Some(TurnInput::text("hello")));
    }

    #[tokio::test]
    async fn test_close_unblocks_parked_waiter() {
        let queue = Arc::new(TurnQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queued_turns_drain_before_closure_is_observed() {
        let queue = TurnQueue::new();
        queue.push(TurnInput::text("queued"));
        queue.close();

        assert_eq!(queue.next().await, Some(TurnInput::text("queued")));
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn test_push_after_close_is_dropped() {
        let queue = TurnQueue::new();
        queue.close();
        queue.push(TurnInput::text("late"));
        assert_eq!(queue.next().await, None);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_handle_controls_are_noops_before_attach() {
        let handle = RunHandle::new(Arc::new(TurnQueue::new()), CancellationToken::new());
        handle.interrupt().await.unwrap();
        handle.set_model("other-model").await.unwrap();
        handle.set_permission_mode("never").await.unwrap();
        assert!(handle.list_tool_servers().await.unwrap().is_empty());
        handle
            .set_tool_server_enabled("search", false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_abort_cancels_and_unblocks() {
        let queue = Arc::new(TurnQueue::new());
        let handle = RunHandle::new(Arc::clone(&queue), CancellationToken::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();

        assert_eq!(consumer.await.unwrap(), None);
        assert!(handle.cancellation_token().is_cancelled());
        assert!(!handle.is_active());
        // Injection after abort must not block or enqueue
        handle.inject("ignored", Vec::new());
        assert!(queue.is_empty());
    }

    struct RecordingControls {
        models: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionControls for RecordingControls {
        async fn interrupt(&self) -> Result<()> {
            Ok(())
        }
        async fn set_model(&self, model: &str) -> Result<()> {
            self.models
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(model.to_string());
            Ok(())
        }
        async fn set_permission_mode(&self, _mode: &str) -> Result<()> {
            Ok(())
        }
        async fn list_tool_servers(&self) -> Result<Vec<ToolServerInfo>> {
            Ok(vec![ToolServerInfo {
                name: "search".to_string(),
                enabled: true,
            }])
        }
        async fn set_tool_server_enabled(&self, _name: &str, _enabled: bool) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_attached_controls_receive_calls() {
        let handle = RunHandle::new(Arc::new(TurnQueue::new()), CancellationToken::new());
        let controls = Arc::new(RecordingControls {
            models: Mutex::new(Vec::new()),
        });
        handle.attach_controls(Arc::clone(&controls) as Arc<dyn SessionControls>);

        handle.set_model("gpt-5-codex").await.unwrap();
        assert_eq!(
            *controls.models.lock().unwrap(),
            vec!["gpt-5-codex".to_string()]
        );
        let servers = handle.list_tool_servers().await.unwrap();
        assert_eq!(servers[0].name, "search");
    }
}
