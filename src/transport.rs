//! Subprocess transport: JSON lines over stdio
//!
//! Both backends are driven the same way at this layer: spawn the binary,
//! write newline-delimited JSON to stdin, read newline-delimited JSON from
//! stdout. The provider layer owns the command line; the transport owns
//! process lifecycle, the read loop, and cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};

const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024; // 1MB

/// Environment variables never passed through to a backend subprocess
const DANGEROUS_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "NODE_OPTIONS",
    "PYTHONPATH",
    "PERL5LIB",
    "RUBYLIB",
];

/// How many trailing stderr bytes are kept for error reporting
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Abstract message transport to a backend process
#[async_trait]
pub trait Transport: Send {
    /// Spawn/connect the underlying process
    async fn connect(&mut self) -> Result<()>;

    /// Write one already-serialized line (caller appends the newline)
    async fn write(&mut self, data: &str) -> Result<()>;

    /// Close stdin, signaling end of input
    async fn end_input(&mut self) -> Result<()>;

    /// Take the stream of parsed JSON values from the process
    fn read_messages(&mut self) -> mpsc::UnboundedReceiver<Result<serde_json::Value>>;

    /// Whether the transport is connected and usable
    fn is_ready(&self) -> bool;

    /// Shut the process down, gracefully first
    async fn close(&mut self) -> Result<()>;
}

/// Specification of a backend process to spawn
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Absolute path to the executable
    pub program: PathBuf,
    /// Arguments, excluding the program name
    pub args: Vec<String>,
    /// Extra environment on top of the parent's
    pub env: HashMap<String, String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
}

/// JSON-lines subprocess transport
#[derive(Debug)]
pub struct SubprocessTransport {
    spec: ProcessSpec,
    process: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    ready: Arc<AtomicBool>,
    max_buffer_size: usize,
    reader_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    stderr_tail: Arc<std::sync::Mutex<String>>,
    cancellation_token: CancellationToken,
}

impl SubprocessTransport {
    /// Create a transport for the given process; does not spawn yet
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] when the spec's environment
    /// contains variables on the blocklist.
    pub fn new(spec: ProcessSpec, cancellation_token: CancellationToken) -> Result<Self> {
        let dangerous: Vec<&str> = spec
            .env
            .keys()
            .map(String::as_str)
            .filter(|key| DANGEROUS_ENV_VARS.contains(key))
            .collect();
        if !dangerous.is_empty() {
            tracing::warn!(vars = ?dangerous, "Rejected blocked environment variables");
            return Err(SessionError::invalid_config(format!(
                "Blocked environment variables: [{}]",
                dangerous.join(", ")
            )));
        }

        Ok(Self {
            spec,
            process: None,
            stdin: None,
            stdout: None,
            ready: Arc::new(AtomicBool::new(false)),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            reader_task: None,
            stderr_task: None,
            stderr_tail: Arc::new(std::sync::Mutex::new(String::new())),
            cancellation_token,
        })
    }

    /// Last captured stderr output, for error context
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cancel all ongoing operations
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args);
        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.spec.cwd {
            cmd.current_dir(cwd);
            cmd.env("PWD", cwd.as_os_str());
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Piped stderr keeps the child away from the parent terminal
            .stderr(Stdio::piped());
        cmd
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.process.is_some() {
            return Ok(());
        }

        let mut cmd = self.build_command();
        let mut child = cmd.spawn().map_err(|e| {
            if let Some(cwd) = &self.spec.cwd {
                if !cwd.exists() {
                    return SessionError::transport(format!(
                        "Working directory does not exist: {}",
                        cwd.display()
                    ));
                }
            }
            SessionError::transport(format!(
                "Failed to start {}: {e}",
                self.spec.program.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::transport("Failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::transport("Failed to get stdout handle"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::transport("Failed to get stderr handle"))?;

        let tail = Arc::clone(&self.stderr_tail);
        let stderr_task = tokio::spawn(async move {
            let mut buffer = vec![0u8; 4096];
            loop {
                match stderr.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buffer[..n]);
                        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                        tail.push_str(&chunk);
                        if tail.len() > STDERR_TAIL_BYTES {
                            let cut = tail.len() - STDERR_TAIL_BYTES;
                            let cut = (cut..tail.len())
                                .find(|i| tail.is_char_boundary(*i))
                                .unwrap_or(cut);
                            tail.drain(..cut);
                        }
                    }
                }
            }
        });

        self.stdin = Some(stdin);
        self.stdout = Some(BufReader::new(stdout));
        self.process = Some(child);
        self.stderr_task = Some(stderr_task);
        self.ready.store(true, Ordering::SeqCst);
        tracing::debug!(program = %self.spec.program.display(), "Backend process started");

        Ok(())
    }

    async fn write(&mut self, data: &str) -> Result<()> {
        if !self.is_ready() {
            return Err(SessionError::transport("Transport is not ready for writing"));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SessionError::transport("stdin not available"))?;
        stdin
            .write_all(data.as_bytes())
            .await
            .map_err(|e| SessionError::transport(format!("Failed to write to stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| SessionError::transport(format!("Failed to flush stdin: {e}")))?;
        Ok(())
    }

    async fn end_input(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin
                .shutdown()
                .await
                .map_err(|e| SessionError::transport(format!("Failed to close stdin: {e}")))?;
        }
        Ok(())
    }

    fn read_messages(&mut self) -> mpsc::UnboundedReceiver<Result<serde_json::Value>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let stdout = self.stdout.take();
        let process = Arc::new(Mutex::new(self.process.take()));
        let max_buffer_size = self.max_buffer_size;
        let cancel_token = self.cancellation_token.clone();
        let stderr_tail = Arc::clone(&self.stderr_tail);

        let task = tokio::spawn(async move {
            let Some(mut stdout) = stdout else {
                let _ = tx.send(Err(SessionError::transport(
                    "Not connected - stdout not available",
                )));
                return;
            };

            let mut json_buffer = String::new();
            loop {
                let mut line = String::new();
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::debug!("Read loop cancelled");
                        break;
                    }
                    result = stdout.read_line(&mut line) => {
                        match result {
                            Ok(0) => break, // EOF
                            Ok(_) => {
                                let line = line.trim();
                                if line.is_empty() {
                                    continue;
                                }

                                // Accumulate until a complete JSON value parses
                                json_buffer.push_str(line);
                                if json_buffer.len() > max_buffer_size {
                                    let _ = tx.send(Err(SessionError::transport(format!(
                                        "JSON message exceeded maximum buffer size of {max_buffer_size} bytes"
                                    ))));
                                    json_buffer.clear();
                                    continue;
                                }

                                if let Ok(data) = serde_json::from_str::<serde_json::Value>(&json_buffer) {
                                    tracing::trace!(
                                        msg_type = data.get("type").and_then(|v| v.as_str()).unwrap_or("unknown"),
                                        "Received backend message"
                                    );
                                    json_buffer.clear();
                                    if tx.send(Ok(data)).is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(SessionError::Io(e)));
                                break;
                            }
                        }
                    }
                }
            }

            if let Ok(mut process_guard) = process.try_lock() {
                if let Some(mut child) = process_guard.take() {
                    // A cancelled session stops the backend mid-turn
                    if cancel_token.is_cancelled() {
                        let _ = child.kill().await;
                    }
                    match child.wait().await {
                        Ok(status) => {
                            if !status.success() {
                                if let Some(code) = status.code() {
                                    let tail = stderr_tail
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner())
                                        .clone();
                                    let stderr =
                                        if tail.is_empty() { None } else { Some(tail) };
                                    let _ = tx.send(Err(SessionError::process(
                                        "Backend process exited with failure",
                                        code,
                                        stderr,
                                    )));
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(SessionError::Io(e)));
                        }
                    }
                }
            }
        });

        self.reader_task = Some(task);
        rx
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        self.cancellation_token.cancel();

        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }

        if let Some(task) = self.reader_task.take() {
            tokio::select! {
                _ = task => {}
                () = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.stdout = None;

        if let Some(mut child) = self.process.take() {
            match tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await {
                Ok(Ok(_status)) => {}
                Ok(Err(e)) => return Err(SessionError::Io(e)),
                Err(_) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }

        Ok(())
    }
}

impl Drop for SubprocessTransport {
    fn drop(&mut self) {
        if let Some(stdin) = self.stdin.take() {
            drop(stdin);
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Some(mut child) = self.process.take() {
            let _ = child.start_kill();
        }
    }
}
