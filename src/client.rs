//! The Control Client: supervised coordinator for a bidirectional session
//!
//! One [`ControlClient`] owns everything a control session needs: the
//! transport to the Agent CLI child process, the correlation table of
//! outstanding control requests, the callback registries (hooks, permission
//! callback, in-process tool servers), the subscriber fan-out, and the state
//! machine that serializes the initialize handshake, concurrent callback
//! dispatch, timeouts, cancellation, and transport failure.
//!
//! ```text
//!           ┌──── launch ────► Launching
//! Initial ──┤                      │ transport ready
//!           │                      ▼
//!           │                Initializing ──── init reply ──► Running
//!           │                      │    timeout/error/exit       │
//!           └──── Failed ◄─────────┘                             │ stop/exit
//!                                                                ▼
//!                                                          Terminating ──► Closed
//! ```
//!
//! A single reader task consumes transport events and routes each frame:
//! control responses resolve pending entries, control requests from the CLI
//! spawn supervised callback tasks, cancel frames fire abort signals, and
//! SDK messages fan out to subscribers (through the event parser when they
//! are partial-streaming deltas). Callback failures and timeouts become
//! error control responses; they never terminate the client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, warn};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::events::{EventParser, StreamUpdate};
use crate::hooks::{AbortSignal, HookContext, HookInvocation, HookRegistry, hook_callback};
use crate::pending::{CallbackKind, PendingTable, RequestKind};
use crate::permissions::ToolPermissionContext;
use crate::protocol::{
    ControlRequestPayload, InboundControlRequest, InboundFrame, OutboundControlRequest,
    RequestIdGenerator, error_response, success_response,
};
use crate::subscribers::{StreamItem, SubscriberHub};
use crate::tools::ToolServer;
use crate::transport::{
    SessionMode, SubprocessTransport, Transport, TransportEvent, TransportStatus,
};
use crate::types::{AgentOptions, McpServerConfig, PermissionMode, SdkMessage};

/// Environment variable bounding the initialize-reply wait, in milliseconds.
pub const STREAM_CLOSE_TIMEOUT_ENV: &str = "STREAM_CLOSE_TIMEOUT";

/// Floor (and default) for the initialize-reply wait.
const INIT_TIMEOUT_FLOOR_MS: u64 = 60_000;

/// Session phase; see the module diagram.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Launching,
    Initializing,
    Running,
    Failed(String),
    Terminating,
    Closed,
}

/// Mutable session view, owned by the client and updated on successful
/// runtime requests.
#[derive(Debug)]
struct SessionState {
    phase: Phase,
    server_info: Option<Value>,
    current_model: Option<String>,
    permission_mode: PermissionMode,
    active_agent: Option<String>,
    system_prompt: Option<String>,
    allowed_tools: Vec<String>,
}

/// Everything the reader loop and callback tasks share.
struct SharedState {
    transport: Arc<dyn Transport>,
    ids: RequestIdGenerator,
    pending: Mutex<PendingTable>,
    hub: StdMutex<SubscriberHub>,
    state: StdMutex<SessionState>,
    /// Frozen before the reader task starts; append-only per instance
    registry: HookRegistry,
    /// Matcher timeout per callback id
    hook_timeouts: HashMap<String, Duration>,
    can_use_tool: Option<crate::permissions::CanUseTool>,
    sdk_servers: HashMap<String, Arc<ToolServer>>,
    agents: HashMap<String, crate::types::AgentDefinition>,
    control_timeout: Duration,
    /// Set on the first `can_use_tool` frame; disables the PreToolUse
    /// permission fallback for the rest of the session
    saw_can_use_tool: Arc<AtomicBool>,
}

impl SharedState {
    fn phase(&self) -> Phase {
        self.state.lock().unwrap().phase.clone()
    }

    fn set_phase(&self, phase: Phase) {
        self.state.lock().unwrap().phase = phase;
    }

    async fn write_value(&self, value: &Value) -> crate::Result<()> {
        self.transport.send(&value.to_string()).await
    }
}

/// Handle to a running control session.
///
/// Created with [`ControlClient::connect`]. All methods take `&self`; the
/// client is internally synchronized and can be shared behind an `Arc`.
pub struct ControlClient {
    shared: Arc<SharedState>,
    options: AgentOptions,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient").finish_non_exhaustive()
    }
}

impl ControlClient {
    /// Launch the Agent CLI and run the initialize handshake.
    ///
    /// On success the session is Running and ready for queries. On failure
    /// the child is torn down and the error names the phase that failed.
    pub async fn connect(options: AgentOptions) -> crate::Result<Self> {
        let transport = SubprocessTransport::start(&options, SessionMode::Control, false)?;
        Self::connect_with_transport(options, Arc::new(transport)).await
    }

    /// Run a control session over an externally supplied transport.
    ///
    /// This is the seam the integration tests drive an in-memory transport
    /// through; production code uses [`connect`](Self::connect).
    pub async fn connect_with_transport(
        options: AgentOptions,
        transport: Arc<dyn Transport>,
    ) -> crate::Result<Self> {
        // Register every user callback and assign stable ids before
        // anything is sent: the initialize payload references callbacks by
        // id only.
        let mut registry = HookRegistry::new();
        let mut hook_timeouts = HashMap::new();
        let mut hooks_payload: serde_json::Map<String, Value> = serde_json::Map::new();

        for (event, matchers) in &options.hooks {
            let mut matcher_entries = Vec::new();
            for matcher in matchers {
                let mut callback_ids = Vec::new();
                for callback in &matcher.hooks {
                    let id = registry.register(callback.clone());
                    hook_timeouts.insert(id.clone(), matcher.effective_timeout());
                    callback_ids.push(id);
                }
                let mut entry = json!({
                    "matcher": matcher.matcher,
                    "hookCallbackIds": callback_ids,
                });
                if let Some(timeout) = matcher.timeout_ms {
                    entry["timeout"] = json!(timeout);
                }
                matcher_entries.push(entry);
            }
            hooks_payload.insert(event.as_wire_str().to_string(), Value::Array(matcher_entries));
        }

        // Permission-via-hook fallback: older CLIs never send can_use_tool
        // frames, so the permission callback also rides an implicit
        // PreToolUse hook until the first real frame proves the CLI speaks
        // can_use_tool.
        let saw_can_use_tool = Arc::new(AtomicBool::new(false));
        if let Some(can_use_tool) = &options.can_use_tool {
            let fallback = {
                let can_use_tool = can_use_tool.clone();
                let disabled = Arc::clone(&saw_can_use_tool);
                hook_callback(move |invocation: HookInvocation| {
                    let can_use_tool = can_use_tool.clone();
                    let disabled = disabled.clone();
                    async move {
                        if disabled.load(Ordering::SeqCst) {
                            return Ok(crate::hooks::HookOutput::pass());
                        }
                        let tool_name = invocation.input["tool_name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        let tool_input = invocation.input["tool_input"].clone();
                        let context = ToolPermissionContext {
                            tool_name,
                            tool_input: tool_input.clone(),
                            session_id: invocation.input["session_id"]
                                .as_str()
                                .map(str::to_string),
                            suggestions: Vec::new(),
                            blocked_path: None,
                            signal: invocation.context.signal.clone(),
                        };
                        let result = can_use_tool(context).await;
                        Ok(result.to_hook_output(&tool_input))
                    }
                })
            };
            let id = registry.register(fallback);
            hook_timeouts.insert(id.clone(), Duration::from_millis(60_000));
            let entry = json!({"matcher": Value::Null, "hookCallbackIds": [id]});
            match hooks_payload.get_mut("PreToolUse") {
                Some(Value::Array(existing)) => existing.push(entry),
                _ => {
                    hooks_payload.insert("PreToolUse".to_string(), Value::Array(vec![entry]));
                }
            }
        }

        let sdk_servers: HashMap<String, Arc<ToolServer>> = options
            .mcp_servers
            .iter()
            .filter_map(|(name, config)| match config {
                McpServerConfig::Sdk(server) => Some((name.clone(), Arc::clone(server))),
                McpServerConfig::Stdio { .. } => None,
            })
            .collect();

        let shared = Arc::new(SharedState {
            transport: Arc::clone(&transport),
            ids: RequestIdGenerator::new(),
            pending: Mutex::new(PendingTable::new()),
            hub: StdMutex::new(SubscriberHub::new(options.pre_subscribe_buffer)),
            state: StdMutex::new(SessionState {
                phase: Phase::Launching,
                server_info: None,
                current_model: options.model.clone(),
                permission_mode: options.permission_mode,
                active_agent: options.active_agent.clone(),
                system_prompt: options.system_prompt.clone(),
                allowed_tools: options.allowed_tools.clone(),
            }),
            registry,
            hook_timeouts,
            can_use_tool: options.can_use_tool.clone(),
            sdk_servers,
            agents: options.agents.clone(),
            control_timeout: Duration::from_millis(options.control_request_timeout_ms),
            saw_can_use_tool,
        });

        // The reader must be live before initialize goes out or the reply
        // is lost.
        let events = transport
            .take_events()
            .ok_or_else(|| crate::Error::connection("transport events already taken"))?;
        let reader_task = tokio::spawn(Self::reader_loop(Arc::clone(&shared), events));

        let client = Self {
            shared: Arc::clone(&shared),
            options,
            reader_task: StdMutex::new(Some(reader_task)),
        };

        shared.set_phase(Phase::Initializing);

        let hooks_value = if hooks_payload.is_empty() {
            None
        } else {
            Some(Value::Object(hooks_payload))
        };
        let server_descriptors = if client.shared.sdk_servers.is_empty() {
            None
        } else {
            Some(Value::Object(
                client
                    .shared
                    .sdk_servers
                    .iter()
                    .map(|(name, server)| {
                        (
                            name.clone(),
                            json!({"name": server.name(), "version": server.version()}),
                        )
                    })
                    .collect(),
            ))
        };
        let agents_value = if client.options.agents.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&client.options.agents)?)
        };

        let init = ControlRequestPayload::Initialize {
            hooks: hooks_value,
            sdk_mcp_servers: server_descriptors,
            agents: agents_value,
            // Omitted entirely when no permission callback is registered;
            // a bare handshake is `{subtype: "initialize", hooks: null}`.
            can_use_tool: client.shared.can_use_tool.is_some().then_some(true),
        };

        match client
            .send_control_request(init, RequestKind::Initialize, init_reply_timeout())
            .await
        {
            Ok(info) => {
                {
                    let mut state = client.shared.state.lock().unwrap();
                    state.server_info = Some(info);
                    state.phase = Phase::Running;
                }
                client.shared.hub.lock().unwrap().enable_delivery();
                debug!("control session initialized");
                Ok(client)
            }
            Err(e) => {
                client.shared.set_phase(Phase::Failed(e.to_string()));
                let _ = client.shared.transport.close().await;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Public API: queries and streaming
    // ------------------------------------------------------------------

    /// Send a user prompt into the session.
    ///
    /// String prompts are wrapped as `{role: "user", content: <string>}`.
    pub async fn query(&self, prompt: impl Into<String>, session_id: Option<&str>) -> crate::Result<()> {
        let message = json!({"role": "user", "content": prompt.into()});
        self.query_message(message, session_id).await
    }

    /// Send a pre-built user message object, injecting `session_id` and a
    /// null `parent_tool_use_id` when omitted.
    pub async fn query_message(
        &self,
        message: Value,
        session_id: Option<&str>,
    ) -> crate::Result<()> {
        self.require_running()?;
        let frame = json!({
            "type": "user",
            "message": message,
            "parent_tool_use_id": Value::Null,
            "session_id": session_id.unwrap_or("default"),
        });
        self.shared.write_value(&frame).await
    }

    /// Register a subscriber and return its lazy message stream.
    ///
    /// The first subscriber drains anything buffered since startup; later
    /// subscribers queue FIFO and are promoted when the current response
    /// completes.
    pub fn stream_messages(&self) -> UnboundedReceiverStream<StreamItem> {
        let rx = self.shared.hub.lock().unwrap().subscribe();
        UnboundedReceiverStream::new(rx)
    }

    // ------------------------------------------------------------------
    // Public API: runtime configuration
    // ------------------------------------------------------------------

    /// Switch the served model.
    ///
    /// Invalid names fail locally with up to 3 suggestions; a concurrent
    /// mutating request fails with `ModelChangeInProgress`. The local model
    /// view is committed only on success.
    pub async fn set_model(&self, model: &str) -> crate::Result<()> {
        self.require_running()?;
        if !crate::types::is_served_model(model) {
            return Err(crate::Error::InvalidModel {
                model: model.to_string(),
                suggestions: crate::types::model_suggestions(model),
            });
        }
        self.guard_mutating_request().await?;

        self.send_control_request(
            ControlRequestPayload::SetModel {
                model: Some(model.to_string()),
            },
            RequestKind::SetModel,
            self.shared.control_timeout,
        )
        .await?;

        self.shared.state.lock().unwrap().current_model = Some(model.to_string());
        Ok(())
    }

    /// Switch the permission mode. Committed locally only on success.
    pub async fn set_permission_mode(&self, mode: PermissionMode) -> crate::Result<()> {
        self.require_running()?;
        self.guard_mutating_request().await?;

        self.send_control_request(
            ControlRequestPayload::SetPermissionMode {
                mode: mode.as_wire_str().to_string(),
            },
            RequestKind::SetPermissionMode,
            self.shared.control_timeout,
        )
        .await?;

        self.shared.state.lock().unwrap().permission_mode = mode;
        Ok(())
    }

    /// Activate a named agent. On success its prompt, allowed tools, and
    /// model are applied to the local session view; enforcement stays with
    /// the CLI.
    pub async fn set_agent(&self, name: &str) -> crate::Result<()> {
        self.require_running()?;
        if self.shared.agents.is_empty() {
            return Err(crate::Error::NoAgentsConfigured);
        }
        let Some(definition) = self.shared.agents.get(name).cloned() else {
            return Err(crate::Error::AgentNotFound(name.to_string()));
        };
        self.guard_mutating_request().await?;

        self.send_control_request(
            ControlRequestPayload::SetAgent {
                agent: name.to_string(),
            },
            RequestKind::SetAgent,
            self.shared.control_timeout,
        )
        .await?;

        let mut state = self.shared.state.lock().unwrap();
        state.active_agent = Some(name.to_string());
        state.system_prompt = Some(definition.prompt.clone());
        if let Some(tools) = definition.tools {
            state.allowed_tools = tools;
        }
        if let Some(model) = definition.model {
            state.current_model = Some(model);
        }
        Ok(())
    }

    /// Cancel the current turn. Surfaces the CLI-provided error on failure.
    pub async fn interrupt(&self) -> crate::Result<()> {
        self.require_running()?;
        self.send_control_request(
            ControlRequestPayload::Interrupt,
            RequestKind::Interrupt,
            self.shared.control_timeout,
        )
        .await?;
        Ok(())
    }

    /// MCP server connection status as reported by the CLI.
    pub async fn mcp_server_status(&self) -> crate::Result<Value> {
        self.require_running()?;
        self.send_control_request(
            ControlRequestPayload::McpStatus,
            RequestKind::OutboundControl,
            self.shared.control_timeout,
        )
        .await
    }

    /// The payload captured from the initialize reply (advertised commands,
    /// output style).
    pub fn get_server_info(&self) -> crate::Result<Value> {
        let state = self.shared.state.lock().unwrap();
        match (&state.phase, &state.server_info) {
            (Phase::Running, Some(info)) => Ok(info.clone()),
            _ => Err(crate::Error::NotInitialized),
        }
    }

    /// The locally tracked current model.
    pub fn get_model(&self) -> Option<String> {
        self.shared.state.lock().unwrap().current_model.clone()
    }

    /// The locally tracked permission mode.
    pub fn get_permission_mode(&self) -> PermissionMode {
        self.shared.state.lock().unwrap().permission_mode
    }

    /// The active named agent, if any.
    pub fn get_agent(&self) -> Option<String> {
        self.shared.state.lock().unwrap().active_agent.clone()
    }

    /// The session's current system prompt (reflects the active agent).
    pub fn get_system_prompt(&self) -> Option<String> {
        self.shared.state.lock().unwrap().system_prompt.clone()
    }

    /// The session's current tool allowlist (reflects the active agent).
    pub fn get_allowed_tools(&self) -> Vec<String> {
        self.shared.state.lock().unwrap().allowed_tools.clone()
    }

    /// Names of all configured agents.
    pub fn get_available_agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close the session: cancel pending work, notify subscribers, and
    /// terminate the child within the grace window.
    pub async fn stop(&self) -> crate::Result<()> {
        self.shared.set_phase(Phase::Terminating);
        {
            let mut pending = self.shared.pending.lock().await;
            pending.fail_all_outbound("session stopped");
            pending.abort_all_callbacks();
        }
        self.shared.hub.lock().unwrap().shutdown(None);
        self.shared.transport.close().await?;
        self.shared.set_phase(Phase::Closed);

        if let Some(task) = self.reader_task.lock().unwrap().take() {
            // The reader ends once the transport's event channel drains.
            tokio::spawn(async move {
                let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound control requests
    // ------------------------------------------------------------------

    fn require_running(&self) -> crate::Result<()> {
        match self.shared.phase() {
            Phase::Running => Ok(()),
            Phase::Launching | Phase::Initializing => Err(crate::Error::NotInitialized),
            Phase::Failed(reason) => Err(crate::Error::connection(format!(
                "session failed: {reason}"
            ))),
            Phase::Terminating | Phase::Closed => Err(crate::Error::connection("session closed")),
        }
    }

    /// At most one mutating runtime request may be in flight.
    async fn guard_mutating_request(&self) -> crate::Result<()> {
        let pending = self.shared.pending.lock().await;
        let busy = pending.has_outbound_of_kind(RequestKind::SetModel)
            || pending.has_outbound_of_kind(RequestKind::SetPermissionMode)
            || pending.has_outbound_of_kind(RequestKind::SetAgent);
        if busy {
            return Err(crate::Error::ModelChangeInProgress);
        }
        Ok(())
    }

    async fn send_control_request(
        &self,
        payload: ControlRequestPayload,
        kind: RequestKind,
        timeout: Duration,
    ) -> crate::Result<Value> {
        let request_id = self.shared.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert_outbound(&request_id, kind, tx, timeout)?;

        let frame = OutboundControlRequest::new(request_id.clone(), payload);
        let line = match frame.encode() {
            Ok(line) => line,
            Err(e) => {
                self.shared.pending.lock().await.remove_outbound(&request_id);
                return Err(e);
            }
        };
        if let Err(e) = self.shared.transport.send(&line).await {
            self.shared.pending.lock().await.remove_outbound(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(crate::Error::protocol("reply channel closed")),
            Err(_) => {
                // Deadline fired: the entry must go before the reply can race in.
                self.shared.pending.lock().await.remove_outbound(&request_id);
                Err(crate::Error::timeout(format!(
                    "control request timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    // ------------------------------------------------------------------
    // The reader loop
    // ------------------------------------------------------------------

    async fn reader_loop(shared: Arc<SharedState>, mut events: mpsc::Receiver<TransportEvent>) {
        let mut parser = EventParser::new();

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Line(line) => match InboundFrame::decode(&line) {
                    Ok(frame) => Self::route_frame(&shared, &mut parser, frame).await,
                    Err(e) => {
                        // Non-JSON output is a terminal protocol failure.
                        error!("undecodable line from agent: {e}");
                        Self::fail_session(&shared, decode_failure_message(&e)).await;
                        break;
                    }
                },
                TransportEvent::StderrLine(line) => {
                    debug!("agent stderr: {line}");
                }
                TransportEvent::Error(e) => {
                    error!("transport error: {e}");
                    Self::fail_session(&shared, decode_failure_message(&e)).await;
                    break;
                }
                TransportEvent::Exit { code, stderr } => {
                    let reason = match code {
                        Some(code) => format!("exit code {code}"),
                        None => "killed".to_string(),
                    };
                    let was_closing =
                        matches!(shared.phase(), Phase::Terminating | Phase::Closed);
                    if was_closing {
                        shared.hub.lock().unwrap().shutdown(None);
                    } else {
                        warn!("agent exited unexpectedly: {reason}");
                        let message = transport_exit_message(&reason, &stderr);
                        shared.set_phase(Phase::Failed(reason.clone()));
                        let mut pending = shared.pending.lock().await;
                        pending.fail_all_outbound(&reason);
                        pending.abort_all_callbacks();
                        drop(pending);
                        shared.hub.lock().unwrap().shutdown(Some(message));
                    }
                    break;
                }
            }
        }
        debug!("reader loop finished");
    }

    async fn route_frame(shared: &Arc<SharedState>, parser: &mut EventParser, frame: InboundFrame) {
        match frame {
            InboundFrame::ControlResponse(response) => {
                let outcome = response.outcome.map_err(crate::Error::protocol);
                let matched = shared
                    .pending
                    .lock()
                    .await
                    .complete_outbound(&response.request_id, outcome);
                if !matched {
                    warn!("control response for unknown request: {}", response.request_id);
                }
            }
            InboundFrame::ControlRequest(request) => {
                Self::dispatch_inbound_request(shared, request).await;
            }
            InboundFrame::ControlCancel { request_id } => {
                let cancelled = shared.pending.lock().await.cancel_callback(&request_id);
                if cancelled.is_none() {
                    debug!("cancel for unknown or finished request: {request_id}");
                }
            }
            InboundFrame::Sdk(message) => {
                Self::route_sdk_message(shared, parser, message);
            }
        }
    }

    fn route_sdk_message(shared: &Arc<SharedState>, parser: &mut EventParser, message: SdkMessage) {
        match &message {
            SdkMessage::StreamEvent(envelope) => {
                let update = parser.parse_envelope(envelope);
                let terminal = matches!(
                    update,
                    StreamUpdate::MessageStop {
                        is_terminal: true,
                        ..
                    }
                );
                let mut hub = shared.hub.lock().unwrap();
                hub.deliver_update(update);
                if terminal {
                    hub.finish_turn();
                }
            }
            SdkMessage::Result(_) => {
                let mut hub = shared.hub.lock().unwrap();
                hub.deliver_message(message);
                hub.finish_turn();
            }
            _ => {
                shared.hub.lock().unwrap().deliver_message(message);
            }
        }
    }

    /// Terminal protocol failure: everything pending fails, subscribers get
    /// one `error_during_execution` result, the transport closes.
    async fn fail_session(shared: &Arc<SharedState>, message: SdkMessage) {
        shared.set_phase(Phase::Failed("protocol failure".to_string()));
        {
            let mut pending = shared.pending.lock().await;
            pending.fail_all_outbound("protocol failure");
            pending.abort_all_callbacks();
        }
        shared.hub.lock().unwrap().shutdown(Some(message));
        let _ = shared.transport.close().await;
    }

    // ------------------------------------------------------------------
    // Inbound control requests (CLI → host)
    // ------------------------------------------------------------------

    async fn dispatch_inbound_request(shared: &Arc<SharedState>, request: InboundControlRequest) {
        let subtype = request.subtype().to_string();
        match subtype.as_str() {
            "hook_callback" => Self::dispatch_hook_callback(shared, request).await,
            "can_use_tool" => Self::dispatch_can_use_tool(shared, request).await,
            "mcp_message" | "sdk_mcp_request" => Self::dispatch_mcp_request(shared, request).await,
            other => {
                let reply = error_response(
                    &request.request_id,
                    &format!("Unsupported control request subtype: {other}"),
                );
                let _ = shared.write_value(&reply).await;
            }
        }
    }

    async fn dispatch_hook_callback(shared: &Arc<SharedState>, request: InboundControlRequest) {
        let request_id = request.request_id.clone();
        let callback_id = request.request["callback_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let Some(callback) = shared.registry.get(&callback_id) else {
            let reply = error_response(
                &request_id,
                &format!("No hook callback registered for id: {callback_id}"),
            );
            let _ = shared.write_value(&reply).await;
            return;
        };

        let timeout = shared
            .hook_timeouts
            .get(&callback_id)
            .copied()
            .unwrap_or(Duration::from_millis(60_000));
        let input = request.request["input"].clone();
        let tool_use_id = request.request["tool_use_id"].as_str().map(str::to_string);
        let signal = AbortSignal::new();

        let invocation = HookInvocation {
            input,
            tool_use_id: tool_use_id.clone(),
            context: HookContext {
                signal: signal.clone(),
            },
        };

        let shared_task = Arc::clone(shared);
        let id_task = request_id.clone();
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            // Wait for the pending entry so cancellation can find us.
            let _ = registered_rx.await;

            // The callback runs on its own task so a panic is contained.
            let handle = tokio::spawn(async move { callback(invocation).await });
            let outcome = tokio::time::timeout(timeout, handle).await;

            let reply = {
                let mut pending = shared_task.pending.lock().await;
                let cancelled = pending.callback_cancelled(&id_task);
                pending.remove_callback(&id_task);
                if cancelled {
                    // Late results are discarded; the one response says so.
                    error_response(&id_task, "Hook callback cancelled by agent")
                } else {
                    match outcome {
                        Ok(Ok(Ok(output))) => match serde_json::to_value(&output) {
                            Ok(value) => success_response(&id_task, value),
                            Err(e) => error_response(
                                &id_task,
                                &format!("Failed to serialize hook output: {e}"),
                            ),
                        },
                        Ok(Ok(Err(e))) => error_response(&id_task, &e.to_string()),
                        Ok(Err(join_error)) => {
                            error_response(&id_task, &format!("Hook callback panicked: {join_error}"))
                        }
                        Err(_) => error_response(
                            &id_task,
                            &format!(
                                "Hook callback timeout after {}s",
                                timeout.as_millis() as f64 / 1000.0
                            ),
                        ),
                    }
                }
            };
            if let Err(e) = shared_task.write_value(&reply).await {
                error!("failed to write hook response: {e}");
            }
        });

        shared.pending.lock().await.insert_callback(
            &request_id,
            CallbackKind::Hook,
            task,
            signal,
            tool_use_id,
        );
        let _ = registered_tx.send(());
    }

    async fn dispatch_can_use_tool(shared: &Arc<SharedState>, request: InboundControlRequest) {
        // Any real can_use_tool frame proves the CLI speaks the protocol;
        // the PreToolUse fallback stands down for the rest of the session.
        shared.saw_can_use_tool.store(true, Ordering::SeqCst);

        let request_id = request.request_id.clone();
        let tool_name = request.request["tool_name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let tool_input = request.request["input"].clone();

        let mode = shared.state.lock().unwrap().permission_mode;
        match mode {
            PermissionMode::BypassPermissions => {
                // Never consults the callback.
                let reply = success_response(
                    &request_id,
                    json!({"behavior": "allow", "updatedInput": tool_input}),
                );
                let _ = shared.write_value(&reply).await;
                return;
            }
            PermissionMode::AcceptEdits
                if matches!(tool_name.as_str(), "Write" | "Edit" | "MultiEdit") =>
            {
                let reply = success_response(
                    &request_id,
                    json!({"behavior": "allow", "updatedInput": tool_input}),
                );
                let _ = shared.write_value(&reply).await;
                return;
            }
            _ => {}
        }

        let Some(can_use_tool) = shared.can_use_tool.clone() else {
            let reply = error_response(&request_id, "can_use_tool callback is not configured");
            let _ = shared.write_value(&reply).await;
            return;
        };

        let suggestions = request.request["permission_suggestions"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let blocked_path = request.request["blocked_path"].as_str().map(str::to_string);
        let session_id = request.request["session_id"].as_str().map(str::to_string);
        let signal = AbortSignal::new();

        let context = ToolPermissionContext {
            tool_name,
            tool_input: tool_input.clone(),
            session_id,
            suggestions,
            blocked_path,
            signal: signal.clone(),
        };

        let shared_task = Arc::clone(shared);
        let id_task = request_id.clone();
        let timeout = shared.control_timeout;
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = registered_rx.await;

            let handle = tokio::spawn(async move { can_use_tool(context).await });
            let outcome = tokio::time::timeout(timeout, handle).await;

            let reply = {
                let mut pending = shared_task.pending.lock().await;
                let cancelled = pending.callback_cancelled(&id_task);
                pending.remove_callback(&id_task);
                if cancelled {
                    error_response(&id_task, "Permission request cancelled by agent")
                } else {
                    match outcome {
                        Ok(Ok(result)) => {
                            success_response(&id_task, result.to_wire_value(&tool_input))
                        }
                        Ok(Err(join_error)) => error_response(
                            &id_task,
                            &format!("Permission callback panicked: {join_error}"),
                        ),
                        Err(_) => error_response(
                            &id_task,
                            &format!(
                                "Permission callback timeout after {}s",
                                timeout.as_millis() as f64 / 1000.0
                            ),
                        ),
                    }
                }
            };
            if let Err(e) = shared_task.write_value(&reply).await {
                error!("failed to write permission response: {e}");
            }
        });

        shared.pending.lock().await.insert_callback(
            &request_id,
            CallbackKind::Permission,
            task,
            signal,
            None,
        );
        let _ = registered_tx.send(());
    }

    async fn dispatch_mcp_request(shared: &Arc<SharedState>, request: InboundControlRequest) {
        let request_id = request.request_id.clone();
        let server_name = request.request["server_name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let message = request.request["message"].clone();

        let Some(server) = shared.sdk_servers.get(&server_name).cloned() else {
            let reply = error_response(
                &request_id,
                &format!("No SDK MCP server registered under name: {server_name}"),
            );
            let _ = shared.write_value(&reply).await;
            return;
        };

        let shared_task = Arc::clone(shared);
        let id_task = request_id.clone();
        let signal = AbortSignal::new();
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = registered_rx.await;
            let mcp_reply = server.handle_message(message).await;

            let reply = {
                let mut pending = shared_task.pending.lock().await;
                let cancelled = pending.callback_cancelled(&id_task);
                pending.remove_callback(&id_task);
                if cancelled {
                    error_response(&id_task, "MCP request cancelled by agent")
                } else {
                    success_response(&id_task, json!({"mcp_response": mcp_reply}))
                }
            };
            if let Err(e) = shared_task.write_value(&reply).await {
                error!("failed to write mcp response: {e}");
            }
        });

        shared.pending.lock().await.insert_callback(
            &request_id,
            CallbackKind::McpRequest,
            task,
            signal,
            None,
        );
        let _ = registered_tx.send(());
    }

    /// Transport liveness as seen by the client.
    pub fn transport_status(&self) -> TransportStatus {
        self.shared.transport.status()
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Initialize-reply wait: `STREAM_CLOSE_TIMEOUT` in milliseconds, floored
/// at 60 s; default (and non-numeric fallback) 60 s.
fn init_reply_timeout() -> Duration {
    let ms = std::env::var(STREAM_CLOSE_TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|v| v.max(INIT_TIMEOUT_FLOOR_MS))
        .unwrap_or(INIT_TIMEOUT_FLOOR_MS);
    Duration::from_millis(ms)
}

/// The terminal result message for undecodable output.
fn decode_failure_message(e: &crate::Error) -> SdkMessage {
    let payload = match e {
        crate::Error::BufferOverflow { limit } => {
            json!({"kind": "buffer_overflow", "limit": limit, "message": e.to_string()})
        }
        _ => json!({"kind": "decode_error", "message": e.to_string()}),
    };
    SdkMessage::from_value(json!({
        "type": "result",
        "subtype": "error_during_execution",
        "is_error": true,
        "error": payload,
    }))
    .expect("result message construction is infallible")
}

/// The terminal result message for an unexpected transport exit.
fn transport_exit_message(reason: &str, stderr: &str) -> SdkMessage {
    SdkMessage::from_value(json!({
        "type": "result",
        "subtype": "error_during_execution",
        "is_error": true,
        "error": {"kind": "transport_exit", "reason": reason, "stderr": stderr},
    }))
    .expect("result message construction is infallible")
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test owns the env var: parallel test threads share the process
    // environment.
    #[test]
    fn test_init_timeout_env_handling() {
        unsafe { std::env::remove_var(STREAM_CLOSE_TIMEOUT_ENV) };
        assert_eq!(init_reply_timeout(), Duration::from_millis(60_000));

        unsafe { std::env::set_var(STREAM_CLOSE_TIMEOUT_ENV, "5") };
        assert_eq!(init_reply_timeout(), Duration::from_millis(60_000));

        unsafe { std::env::set_var(STREAM_CLOSE_TIMEOUT_ENV, "not-a-number") };
        assert_eq!(init_reply_timeout(), Duration::from_millis(60_000));

        unsafe { std::env::set_var(STREAM_CLOSE_TIMEOUT_ENV, "120000") };
        assert_eq!(init_reply_timeout(), Duration::from_millis(120_000));

        unsafe { std::env::remove_var(STREAM_CLOSE_TIMEOUT_ENV) };
    }

    #[test]
    fn test_decode_failure_message_shapes() {
        let msg = decode_failure_message(&crate::Error::BufferOverflow { limit: 1024 });
        let value = msg.to_value();
        assert_eq!(value["subtype"], "error_during_execution");
        assert_eq!(value["is_error"], json!(true));
        assert_eq!(value["error"]["kind"], "buffer_overflow");
        assert_eq!(value["error"]["limit"], json!(1024));

        let msg = decode_failure_message(&crate::Error::parse("bad json"));
        assert_eq!(msg.to_value()["error"]["kind"], "decode_error");
    }

    #[test]
    fn test_transport_exit_message_carries_stderr() {
        let msg = transport_exit_message("exit code 2", "fatal: no auth");
        let value = msg.to_value();
        assert_eq!(value["error"]["kind"], "transport_exit");
        assert_eq!(value["error"]["reason"], "exit code 2");
        assert!(value["error"]["stderr"].as_str().unwrap().contains("auth"));
    }
}
