//! Subprocess transport to the Agent CLI
//!
//! The Agent CLI is a child process speaking newline-delimited JSON on
//! stdin/stdout. This module owns the process: spawning with the constructed
//! argument vector and merged environment, splitting stdout into lines,
//! capturing stderr, surfacing exit, and closing with a grace window.
//!
//! The [`Transport`] trait exists so the Control Client can be driven by an
//! in-memory pair of channels in tests; [`SubprocessTransport`] is the real
//! implementation.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};

use crate::types::{AgentOptions, McpServerConfig};

/// Environment variable naming the embedding entrypoint.
pub const ENTRYPOINT_ENV: &str = "AGENT_ENTRYPOINT";

/// Environment variable carrying the SDK version string.
pub const SDK_VERSION_ENV: &str = "AGENT_SDK_VERSION";

/// Default binary name looked up on `PATH`.
pub const DEFAULT_CLI_BINARY: &str = "agent-cli";

/// Grace window between requesting shutdown and force-killing the child.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// How many trailing stderr lines are retained for process errors.
const STDERR_TAIL: usize = 50;

/// Which wire mode the child is launched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Persistent bidirectional control session
    Control,
    /// Fire-and-stream one-shot query
    OneShot,
}

impl SessionMode {
    fn entrypoint(&self) -> &'static str {
        match self {
            SessionMode::Control => "sdk-host",
            SessionMode::OneShot => "sdk-host-oneshot",
        }
    }
}

/// One event from the transport's reader side.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete stdout line
    Line(String),
    /// A stderr line
    StderrLine(String),
    /// The child exited; `code` is `None` when killed by signal
    Exit { code: Option<i32>, stderr: String },
    /// Terminal framing failure (buffer overflow); the transport closes
    Error(crate::Error),
}

/// Liveness as observed by the monitor task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Alive,
    Exited(Option<i32>),
}

/// Duplex byte stream to the Agent CLI.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one frame plus the trailing newline. Fails with a connection
    /// error once the process has exited.
    async fn send(&self, line: &str) -> crate::Result<()>;

    /// Close the writable half. One-shot string prompts end input after the
    /// prompt is written.
    async fn end_input(&self) -> crate::Result<()>;

    /// Terminate the child: grace window first, then kill.
    async fn close(&self) -> crate::Result<()>;

    /// Take the event receiver. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Current liveness.
    fn status(&self) -> TransportStatus;
}

// ============================================================================
// LINE FRAMING
// ============================================================================

/// Splits a byte stream into `\n`-terminated lines with a bounded residual
/// buffer.
///
/// If the residual would exceed `max_buffer_size` without a newline, the
/// framer reports overflow and the transport must shut down: an unbounded
/// line means the peer is not speaking the protocol.
pub(crate) struct LineFramer {
    residual: Vec<u8>,
    max_buffer_size: usize,
}

impl LineFramer {
    pub(crate) fn new(max_buffer_size: usize) -> Self {
        Self {
            residual: Vec::new(),
            max_buffer_size,
        }
    }

    /// Feed a chunk; returns the complete lines it yielded.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> crate::Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut start = 0;

        for (i, byte) in chunk.iter().enumerate() {
            if *byte == b'\n' {
                let mut line = std::mem::take(&mut self.residual);
                line.extend_from_slice(&chunk[start..i]);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                lines.push(String::from_utf8_lossy(&line).into_owned());
                start = i + 1;
            }
        }

        self.residual.extend_from_slice(&chunk[start..]);
        if self.residual.len() > self.max_buffer_size {
            self.residual.clear();
            return Err(crate::Error::BufferOverflow {
                limit: self.max_buffer_size,
            });
        }

        Ok(lines)
    }
}

// ============================================================================
// ARGUMENT & ENVIRONMENT CONSTRUCTION
// ============================================================================

/// Build the CLI argument vector for the given mode.
///
/// `stream-json` output is forced for both modes — the SDK cannot parse
/// anything else — but a requested output schema still passes through.
/// One-shot prompts never appear in argv: a string prompt is written to
/// stdin, and `streaming_input` selects the NDJSON input mode instead.
pub(crate) fn build_cli_args(
    options: &AgentOptions,
    mode: SessionMode,
    streaming_input: bool,
) -> Vec<String> {
    let mut args = Vec::new();

    match mode {
        SessionMode::Control => {
            args.push("--input-format".to_string());
            args.push("stream-json".to_string());
        }
        SessionMode::OneShot => {
            args.push("--print".to_string());
            if streaming_input {
                // Enumerable prompt: NDJSON objects arrive on stdin
                args.push("--input-format".to_string());
                args.push("stream-json".to_string());
            }
        }
    }

    if let Some(format) = &options.output_format {
        if format != "stream-json" {
            debug!("output_format {format:?} overridden; the SDK only parses stream-json");
        }
    }
    args.push("--output-format".to_string());
    args.push("stream-json".to_string());
    args.push("--verbose".to_string());

    if let Some(model) = &options.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(prompt) = &options.system_prompt {
        args.push("--system-prompt".to_string());
        args.push(prompt.clone());
    }
    if !options.allowed_tools.is_empty() {
        args.push("--allowed-tools".to_string());
        args.push(options.allowed_tools.join(","));
    }
    if !options.disallowed_tools.is_empty() {
        args.push("--disallowed-tools".to_string());
        args.push(options.disallowed_tools.join(","));
    }
    args.push("--permission-mode".to_string());
    args.push(options.permission_mode.as_wire_str().to_string());
    if let Some(tool) = &options.permission_prompt_tool {
        args.push("--permission-prompt-tool".to_string());
        args.push(tool.clone());
    }
    if let Some(turns) = options.max_turns {
        args.push("--max-turns".to_string());
        args.push(turns.to_string());
    }
    if let Some(budget) = options.max_budget_usd {
        args.push("--max-budget-usd".to_string());
        args.push(budget.to_string());
    }
    if let Some(tokens) = options.max_thinking_tokens {
        args.push("--max-thinking-tokens".to_string());
        args.push(tokens.to_string());
    }
    if options.include_partial_messages || mode == SessionMode::Control {
        args.push("--include-partial-messages".to_string());
    }
    if let Some(schema) = &options.output_schema {
        args.push("--output-schema".to_string());
        args.push(schema.to_string());
    }

    // External stdio servers are handed to the CLI; in-process servers are
    // announced later, during the initialize handshake.
    let external: HashMap<&String, serde_json::Value> = options
        .mcp_servers
        .iter()
        .filter_map(|(name, config)| match config {
            McpServerConfig::Stdio { command, args, env } => Some((
                name,
                serde_json::json!({"command": command, "args": args, "env": env}),
            )),
            McpServerConfig::Sdk(_) => None,
        })
        .collect();
    if !external.is_empty() {
        args.push("--mcp-config".to_string());
        args.push(serde_json::json!({ "mcpServers": external }).to_string());
    }

    args
}

/// Merge the SDK's environment contract with host overrides (host wins).
pub(crate) fn build_env(options: &AgentOptions, mode: SessionMode) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = HashMap::new();
    env.insert(ENTRYPOINT_ENV.to_string(), mode.entrypoint().to_string());
    env.insert(
        SDK_VERSION_ENV.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    if let Some(user) = &options.user {
        env.insert("USER".to_string(), user.clone());
        env.insert("LOGNAME".to_string(), user.clone());
    }
    for (key, value) in &options.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

// ============================================================================
// SUBPROCESS TRANSPORT
// ============================================================================

/// The real transport: an Agent CLI child process.
pub struct SubprocessTransport {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    child: Arc<Mutex<Option<Child>>>,
    events: StdMutex<Option<mpsc::Receiver<TransportEvent>>>,
    status: Arc<StdMutex<TransportStatus>>,
}

impl SubprocessTransport {
    /// Spawn the Agent CLI and wire up the reader tasks.
    pub fn start(
        options: &AgentOptions,
        mode: SessionMode,
        streaming_input: bool,
    ) -> crate::Result<Self> {
        let program = options
            .cli_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CLI_BINARY.into());
        let args = build_cli_args(options, mode, streaming_input);
        let env = build_env(options, mode);
        Self::spawn(program, args, env, options.cwd.clone(), options.max_buffer_size)
    }

    /// Spawn an arbitrary program through the same plumbing. Test seam.
    pub(crate) fn start_raw(
        program: impl Into<std::path::PathBuf>,
        args: Vec<String>,
        options: &AgentOptions,
    ) -> crate::Result<Self> {
        Self::spawn(
            program.into(),
            args,
            HashMap::new(),
            None,
            options.max_buffer_size,
        )
    }

    fn spawn(
        program: std::path::PathBuf,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<std::path::PathBuf>,
        max_buffer_size: usize,
    ) -> crate::Result<Self> {
        debug!("launching {:?} with {} args", program, args.len());

        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            crate::Error::connection(format!("failed to launch {}: {e}", program.display()))
        })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| crate::Error::connection("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| crate::Error::connection("child stderr not captured"))?;

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(256);
        let status = Arc::new(StdMutex::new(TransportStatus::Alive));
        let child = Arc::new(Mutex::new(Some(child)));
        let stderr_tail: Arc<StdMutex<VecDeque<String>>> =
            Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL)));

        // stderr reader: every line becomes an event and lands in the tail
        // ring used for process errors.
        let stderr_task = {
            let event_tx = event_tx.clone();
            let stderr_tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    {
                        let mut tail = stderr_tail.lock().unwrap();
                        if tail.len() == STDERR_TAIL {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                    }
                    if event_tx.send(TransportEvent::StderrLine(line)).await.is_err() {
                        break;
                    }
                }
            })
        };

        // stdout reader: manual framing so the buffer cap is enforced, then
        // exit observation once the pipe closes.
        {
            let event_tx = event_tx.clone();
            let child = Arc::clone(&child);
            let status = Arc::clone(&status);
            let stderr_tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut stdout = stdout;
                let mut framer = LineFramer::new(max_buffer_size);
                let mut chunk = [0u8; 8192];

                loop {
                    match stdout.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => match framer.push(&chunk[..n]) {
                            Ok(lines) => {
                                for line in lines {
                                    if line.trim().is_empty() {
                                        continue;
                                    }
                                    if event_tx.send(TransportEvent::Line(line)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("transport framing failure: {e}");
                                let _ = event_tx.send(TransportEvent::Error(e)).await;
                                if let Some(mut c) = child.lock().await.take() {
                                    let _ = c.start_kill();
                                    let _ = c.wait().await;
                                }
                                *status.lock().unwrap() = TransportStatus::Exited(None);
                                return;
                            }
                        },
                        Err(e) => {
                            debug!("stdout read error: {e}");
                            break;
                        }
                    }
                }

                // Pipe closed; collect the exit status. The stderr reader
                // finishes first so the tail is complete when Exit goes out.
                let code = match child.lock().await.as_mut() {
                    Some(c) => c.wait().await.ok().and_then(|s| s.code()),
                    None => None,
                };
                let _ = tokio::time::timeout(Duration::from_secs(1), stderr_task).await;
                *status.lock().unwrap() = TransportStatus::Exited(code);
                let stderr = stderr_tail.lock().unwrap().iter().cloned().collect::<Vec<_>>();
                let _ = event_tx
                    .send(TransportEvent::Exit {
                        code,
                        stderr: stderr.join("\n"),
                    })
                    .await;
            });
        }

        Ok(Self {
            stdin: Arc::new(Mutex::new(stdin)),
            child,
            events: StdMutex::new(Some(event_rx)),
            status,
        })
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn send(&self, line: &str) -> crate::Result<()> {
        if self.status() != TransportStatus::Alive {
            return Err(crate::Error::connection("transport closed"));
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| crate::Error::connection("stdin already closed"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn end_input(&self) -> crate::Result<()> {
        // Dropping the handle closes the pipe.
        self.stdin.lock().await.take();
        Ok(())
    }

    async fn close(&self) -> crate::Result<()> {
        self.stdin.lock().await.take();

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(Ok(exit)) => {
                    *self.status.lock().unwrap() = TransportStatus::Exited(exit.code());
                }
                Ok(Err(e)) => {
                    debug!("wait on child failed: {e}");
                    *self.status.lock().unwrap() = TransportStatus::Exited(None);
                }
                Err(_) => {
                    warn!("child did not exit within {CLOSE_GRACE:?}; killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    *self.status.lock().unwrap() = TransportStatus::Exited(None);
                }
            }
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().unwrap().take()
    }

    fn status(&self) -> TransportStatus {
        self.status.lock().unwrap().clone()
    }
}
