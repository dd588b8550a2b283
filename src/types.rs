//! Core type definitions for the Agent Host SDK.
//!
//! This module contains the fundamental data structures used throughout the SDK:
//! session configuration ([`AgentOptions`] and its builder), permission modes,
//! named agent definitions, and the SDK message model that mirrors the Agent
//! CLI's newline-delimited JSON output.
//!
//! # Message Model
//!
//! Every line the Agent CLI prints is a JSON object with a `type` field. The
//! control-plane types (`control_request`, `control_response`,
//! `control_cancel_request`) are handled by the protocol module; everything
//! else is an [`SdkMessage`]:
//!
//! - `user` / `assistant` — conversation messages, optionally tagged with a
//!   `parent_tool_use_id` naming the subagent that produced them
//! - `system` — CLI status messages (init banners, notices)
//! - `result` — terminal summary of a run: cost, duration, turn count
//! - `stream_event` — partial-message deltas, wrapped with routing metadata
//!
//! Unknown `type` values are preserved verbatim so newer CLIs keep working
//! against older SDKs.
//!
//! # Example
//!
//! ```no_run
//! use agent_host::{AgentOptions, PermissionMode};
//!
//! let options = AgentOptions::builder()
//!     .model("sonnet")
//!     .system_prompt("You are a helpful assistant")
//!     .permission_mode(PermissionMode::AcceptEdits)
//!     .max_turns(10)
//!     .build()
//!     .unwrap();
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hooks::{HookEvent, HookMatcher};
use crate::permissions::CanUseTool;
use crate::tools::ToolServer;

// ============================================================================
// PERMISSION MODE
// ============================================================================

/// Permission mode governing how the Agent CLI treats tool calls.
///
/// The wire protocol uses camelCase names (`"acceptEdits"`,
/// `"bypassPermissions"`); the host API uses the Rust-idiomatic variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    /// Prompt for permission per the CLI's own rules
    #[default]
    Default,
    /// Auto-approve file edit tools (`Write`, `Edit`, `MultiEdit`)
    AcceptEdits,
    /// Planning mode; no tool execution
    Plan,
    /// Skip all permission checks; the permission callback is never invoked
    BypassPermissions,
}

impl PermissionMode {
    /// The wire-protocol spelling of this mode.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }

    /// Parse either the wire spelling or the snake_case host spelling.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "acceptEdits" | "accept_edits" => Ok(PermissionMode::AcceptEdits),
            "plan" => Ok(PermissionMode::Plan),
            "bypassPermissions" | "bypass_permissions" => Ok(PermissionMode::BypassPermissions),
            other => Err(crate::Error::validation(format!(
                "Invalid permission mode: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

// ============================================================================
// NAMED AGENTS
// ============================================================================

/// A named agent definition the CLI can switch to at runtime.
///
/// `description` and `prompt` must be non-empty; `tools` and `model` are
/// optional refinements applied while the agent is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Short human-readable description, surfaced in agent listings
    pub description: String,
    /// System prompt used while this agent is active
    pub prompt: String,
    /// Tool allowlist override; `None` inherits the session's tools
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    /// Model override; `None` inherits the session model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentDefinition {
    /// Create a definition with just a description and prompt.
    pub fn new(description: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            prompt: prompt.into(),
            tools: None,
            model: None,
        }
    }

    /// Restrict the agent to the given tools.
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Pin the agent to a specific model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Validate the definition per the protocol rules.
    pub fn validate(&self, name: &str) -> crate::Result<()> {
        if self.description.trim().is_empty() {
            return Err(crate::Error::validation(format!(
                "Agent '{name}': description must be a non-empty string"
            )));
        }
        if self.prompt.trim().is_empty() {
            return Err(crate::Error::validation(format!(
                "Agent '{name}': prompt must be a non-empty string"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// MODEL VALIDATION
// ============================================================================

/// The closed table of model names the CLI serves.
///
/// `set_model` validates against this table before anything goes on the wire
/// so a typo fails fast with suggestions instead of a round-trip error.
pub(crate) const SERVED_MODELS: &[&str] = &["default", "opus", "sonnet", "haiku", "opusplan"];

pub(crate) fn is_served_model(name: &str) -> bool {
    SERVED_MODELS.contains(&name)
}

/// Up to 3 served models closest to `name` by edit distance.
pub(crate) fn model_suggestions(name: &str) -> Vec<String> {
    let mut scored: Vec<(usize, &str)> = SERVED_MODELS
        .iter()
        .map(|m| (edit_distance(name, m), *m))
        .collect();
    scored.sort_by_key(|(d, m)| (*d, *m));
    scored
        .into_iter()
        .take(3)
        .map(|(_, m)| m.to_string())
        .collect()
}

/// Classic two-row Levenshtein distance. The model table is tiny, so no
/// cleverness is warranted.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ============================================================================
// MCP SERVER CONFIGURATION
// ============================================================================

/// Configuration for one MCP server visible to the Agent CLI.
#[derive(Clone)]
pub enum McpServerConfig {
    /// An in-process tool server; requests are routed back to the host over
    /// the control protocol instead of spawning anything
    Sdk(Arc<ToolServer>),
    /// An external stdio server the CLI spawns itself
    Stdio {
        /// Executable to spawn
        command: String,
        /// Arguments for the executable
        args: Vec<String>,
        /// Extra environment for the spawned server
        env: HashMap<String, String>,
    },
}

impl std::fmt::Debug for McpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            McpServerConfig::Sdk(server) => f
                .debug_struct("McpServerConfig::Sdk")
                .field("name", &server.name())
                .field("tools", &server.tool_names())
                .finish(),
            McpServerConfig::Stdio { command, args, .. } => f
                .debug_struct("McpServerConfig::Stdio")
                .field("command", command)
                .field("args", args)
                .finish(),
        }
    }
}

// ============================================================================
// AGENT OPTIONS
// ============================================================================

/// Default cap on the transport's residual line buffer: 1 MiB.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Default bound on outbound control requests, in milliseconds.
pub const DEFAULT_CONTROL_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Default cap on the pre-subscribe message buffer (element count).
pub const DEFAULT_PRE_SUBSCRIBE_BUFFER: usize = 1024;

/// Immutable-on-start session configuration.
///
/// Built with [`AgentOptions::builder()`]. A subset — model, permission mode,
/// active named agent — is mutable at runtime through explicit control
/// requests on the [`ControlClient`](crate::ControlClient).
#[derive(Clone, Default)]
pub struct AgentOptions {
    pub(crate) model: Option<String>,
    pub(crate) system_prompt: Option<String>,
    pub(crate) allowed_tools: Vec<String>,
    pub(crate) disallowed_tools: Vec<String>,
    pub(crate) permission_mode: PermissionMode,
    pub(crate) permission_prompt_tool: Option<String>,
    pub(crate) max_turns: Option<u32>,
    pub(crate) max_budget_usd: Option<f64>,
    pub(crate) max_thinking_tokens: Option<u32>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) user: Option<String>,
    pub(crate) include_partial_messages: bool,
    pub(crate) hooks: HashMap<HookEvent, Vec<HookMatcher>>,
    pub(crate) can_use_tool: Option<CanUseTool>,
    pub(crate) mcp_servers: HashMap<String, McpServerConfig>,
    pub(crate) agents: HashMap<String, AgentDefinition>,
    pub(crate) active_agent: Option<String>,
    pub(crate) output_format: Option<String>,
    pub(crate) output_schema: Option<Value>,
    pub(crate) max_buffer_size: usize,
    pub(crate) control_request_timeout_ms: u64,
    pub(crate) pre_subscribe_buffer: usize,
    pub(crate) cli_path: Option<PathBuf>,
}

impl std::fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOptions")
            .field("model", &self.model)
            .field("permission_mode", &self.permission_mode)
            .field("allowed_tools", &self.allowed_tools)
            .field("disallowed_tools", &self.disallowed_tools)
            .field("max_turns", &self.max_turns)
            .field("include_partial_messages", &self.include_partial_messages)
            .field("hooks", &format!("{} events", self.hooks.len()))
            .field("can_use_tool", &self.can_use_tool.is_some())
            .field("mcp_servers", &self.mcp_servers.keys().collect::<Vec<_>>())
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("active_agent", &self.active_agent)
            .finish()
    }
}

impl AgentOptions {
    /// Start building a configuration.
    pub fn builder() -> AgentOptionsBuilder {
        AgentOptionsBuilder::default()
    }

    /// The configured model name, if any.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// The configured permission mode.
    pub fn permission_mode(&self) -> PermissionMode {
        self.permission_mode
    }

    /// The configured named agents.
    pub fn agents(&self) -> &HashMap<String, AgentDefinition> {
        &self.agents
    }

    /// The residual line-buffer cap in bytes.
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// True when this configuration needs the bidirectional control
    /// session: hooks, a permission callback, in-process MCP servers, or
    /// named agents all require it.
    pub fn needs_control_session(&self) -> bool {
        !self.hooks.is_empty()
            || self.can_use_tool.is_some()
            || self
                .mcp_servers
                .values()
                .any(|s| matches!(s, McpServerConfig::Sdk(_)))
            || !self.agents.is_empty()
    }
}

/// Builder for [`AgentOptions`].
///
/// All setters consume and return `self` for chaining; `build()` validates
/// the result.
#[derive(Default)]
pub struct AgentOptionsBuilder {
    options: AgentOptions,
}

impl std::fmt::Debug for AgentOptionsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOptionsBuilder")
            .field("options", &self.options)
            .finish()
    }
}

impl AgentOptionsBuilder {
    /// Model the CLI should serve.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.options.model = Some(model.into());
        self
    }

    /// System prompt for the session.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.system_prompt = Some(prompt.into());
        self
    }

    /// Tools the CLI may use (comma-joined onto the command line).
    pub fn allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.options.allowed_tools = tools;
        self
    }

    /// Tools the CLI must not use.
    pub fn disallowed_tools(mut self, tools: Vec<String>) -> Self {
        self.options.disallowed_tools = tools;
        self
    }

    /// Initial permission mode.
    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.options.permission_mode = mode;
        self
    }

    /// MCP tool the CLI should consult for permission prompts. Conflicts
    /// with [`can_use_tool`](Self::can_use_tool).
    pub fn permission_prompt_tool(mut self, tool: impl Into<String>) -> Self {
        self.options.permission_prompt_tool = Some(tool.into());
        self
    }

    /// Cap on conversation turns.
    pub fn max_turns(mut self, turns: u32) -> Self {
        self.options.max_turns = Some(turns);
        self
    }

    /// Cap on total spend in USD.
    pub fn max_budget_usd(mut self, budget: f64) -> Self {
        self.options.max_budget_usd = Some(budget);
        self
    }

    /// Cap on thinking tokens per turn.
    pub fn max_thinking_tokens(mut self, tokens: u32) -> Self {
        self.options.max_thinking_tokens = Some(tokens);
        self
    }

    /// Working directory for the child process.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.options.cwd = Some(cwd.into());
        self
    }

    /// Extra environment for the child process. Host-supplied entries win
    /// over SDK defaults.
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.options.env = env;
        self
    }

    /// Identity for the child process (`USER`/`LOGNAME`).
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.options.user = Some(user.into());
        self
    }

    /// Enable partial-message streaming events. Forced on for control
    /// sessions regardless of this setting.
    pub fn include_partial_messages(mut self, include: bool) -> Self {
        self.options.include_partial_messages = include;
        self
    }

    /// Register a hook matcher for an event.
    pub fn hook(mut self, event: HookEvent, matcher: HookMatcher) -> Self {
        self.options.hooks.entry(event).or_default().push(matcher);
        self
    }

    /// Replace the whole hook table.
    pub fn hooks(mut self, hooks: HashMap<HookEvent, Vec<HookMatcher>>) -> Self {
        self.options.hooks = hooks;
        self
    }

    /// Permission callback consulted on `can_use_tool` requests.
    pub fn can_use_tool(mut self, callback: CanUseTool) -> Self {
        self.options.can_use_tool = Some(callback);
        self
    }

    /// Register an in-process MCP tool server under its own name.
    pub fn mcp_server(mut self, server: ToolServer) -> Self {
        self.options.mcp_servers.insert(
            server.name().to_string(),
            McpServerConfig::Sdk(Arc::new(server)),
        );
        self
    }

    /// Register an external stdio MCP server.
    pub fn stdio_mcp_server(
        mut self,
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        self.options.mcp_servers.insert(
            name.into(),
            McpServerConfig::Stdio {
                command: command.into(),
                args,
                env,
            },
        );
        self
    }

    /// Add a named agent to the table.
    pub fn agent(mut self, name: impl Into<String>, definition: AgentDefinition) -> Self {
        self.options.agents.insert(name.into(), definition);
        self
    }

    /// Name of the agent active at startup. Must exist in the table.
    pub fn active_agent(mut self, name: impl Into<String>) -> Self {
        self.options.active_agent = Some(name.into());
        self
    }

    /// Output format preference. One-shot only: control sessions always use
    /// `stream-json`.
    pub fn output_format(mut self, format: impl Into<String>) -> Self {
        self.options.output_format = Some(format.into());
        self
    }

    /// JSON schema for structured output. Passed through even when the
    /// output format itself is forced to `stream-json`.
    pub fn output_schema(mut self, schema: Value) -> Self {
        self.options.output_schema = Some(schema);
        self
    }

    /// Residual line-buffer cap in bytes (default 1 MiB).
    pub fn max_buffer_size(mut self, bytes: usize) -> Self {
        self.options.max_buffer_size = bytes;
        self
    }

    /// Bound on outbound control requests in milliseconds (default 60 000).
    pub fn control_request_timeout_ms(mut self, ms: u64) -> Self {
        self.options.control_request_timeout_ms = ms;
        self
    }

    /// Cap on messages buffered before the first subscriber attaches.
    pub fn pre_subscribe_buffer(mut self, entries: usize) -> Self {
        self.options.pre_subscribe_buffer = entries;
        self
    }

    /// Path to the Agent CLI binary. Defaults to `agent-cli` on `PATH`.
    pub fn cli_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.cli_path = Some(path.into());
        self
    }

    /// Validate and produce the final options.
    pub fn build(mut self) -> crate::Result<AgentOptions> {
        if self.options.max_buffer_size == 0 {
            self.options.max_buffer_size = DEFAULT_MAX_BUFFER_SIZE;
        }
        if self.options.control_request_timeout_ms == 0 {
            self.options.control_request_timeout_ms = DEFAULT_CONTROL_REQUEST_TIMEOUT_MS;
        }
        if self.options.pre_subscribe_buffer == 0 {
            self.options.pre_subscribe_buffer = DEFAULT_PRE_SUBSCRIBE_BUFFER;
        }

        if self.options.permission_prompt_tool.is_some() && self.options.can_use_tool.is_some() {
            return Err(crate::Error::validation(
                "permission_prompt_tool and can_use_tool cannot both be configured",
            ));
        }

        for (name, definition) in &self.options.agents {
            definition.validate(name)?;
        }

        if let Some(active) = &self.options.active_agent {
            if self.options.agents.is_empty() {
                return Err(crate::Error::NoAgentsConfigured);
            }
            if !self.options.agents.contains_key(active) {
                return Err(crate::Error::AgentNotFound(active.clone()));
            }
        }

        Ok(self.options)
    }
}

// ============================================================================
// SDK MESSAGES
// ============================================================================

/// Usage counters reported by the CLI.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

/// Terminal summary of a run.
///
/// `subtype` is `success` or one of the CLI's `error_*` values; unknown
/// subtypes pass through untouched, as do any fields this struct does not
/// model (they land in `extra`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub subtype: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A partial-message event wrapped with routing metadata.
///
/// `parent_tool_use_id` names the subagent that produced the event; absence
/// means the main agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEventEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    pub event: Value,
}

/// One SDK message from the Agent CLI (everything that is not a control
/// frame).
#[derive(Debug, Clone, PartialEq)]
pub enum SdkMessage {
    /// A user message echoed (or injected) by the CLI
    User(Value),
    /// An assistant message
    Assistant(Value),
    /// A CLI status/system message
    System(Value),
    /// Terminal result summary
    Result(ResultMessage),
    /// Partial-message delta with wrapper metadata
    StreamEvent(StreamEventEnvelope),
    /// A message type this SDK does not know; preserved byte-for-byte
    Unknown(Value),
}

impl SdkMessage {
    /// Classify a raw JSON object by its `type` field.
    pub fn from_value(raw: Value) -> crate::Result<SdkMessage> {
        let msg_type = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match msg_type.as_str() {
            "user" => Ok(SdkMessage::User(raw)),
            "assistant" => Ok(SdkMessage::Assistant(raw)),
            "system" => Ok(SdkMessage::System(raw)),
            "result" => {
                let mut result: ResultMessage = serde_json::from_value(raw)?;
                // `type` round-trips through the flattened extras
                result.extra.remove("type");
                Ok(SdkMessage::Result(result))
            }
            "stream_event" => {
                let mut obj = raw;
                if let Some(map) = obj.as_object_mut() {
                    map.remove("type");
                }
                let envelope: StreamEventEnvelope = serde_json::from_value(obj)?;
                Ok(SdkMessage::StreamEvent(envelope))
            }
            _ => Ok(SdkMessage::Unknown(raw)),
        }
    }

    /// Re-encode as the wire JSON object.
    pub fn to_value(&self) -> Value {
        match self {
            SdkMessage::User(raw)
            | SdkMessage::Assistant(raw)
            | SdkMessage::System(raw)
            | SdkMessage::Unknown(raw) => raw.clone(),
            SdkMessage::Result(result) => {
                let mut value = serde_json::to_value(result).unwrap_or(Value::Null);
                if let Some(map) = value.as_object_mut() {
                    map.insert("type".to_string(), Value::String("result".to_string()));
                }
                value
            }
            SdkMessage::StreamEvent(envelope) => {
                let mut value = serde_json::to_value(envelope).unwrap_or(Value::Null);
                if let Some(map) = value.as_object_mut() {
                    map.insert(
                        "type".to_string(),
                        Value::String("stream_event".to_string()),
                    );
                }
                value
            }
        }
    }

    /// The subagent that produced this message, if any. `None` means the
    /// main agent.
    pub fn parent_tool_use_id(&self) -> Option<&str> {
        match self {
            SdkMessage::User(raw) | SdkMessage::Assistant(raw) => {
                raw.get("parent_tool_use_id").and_then(Value::as_str)
            }
            SdkMessage::StreamEvent(envelope) => envelope.parent_tool_use_id.as_deref(),
            _ => None,
        }
    }

    /// Session id the CLI attached to this message, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SdkMessage::User(raw) | SdkMessage::Assistant(raw) | SdkMessage::System(raw) => {
                raw.get("session_id").and_then(Value::as_str)
            }
            SdkMessage::Result(result) => result.session_id.as_deref(),
            SdkMessage::StreamEvent(envelope) => envelope.session_id.as_deref(),
            SdkMessage::Unknown(raw) => raw.get("session_id").and_then(Value::as_str),
        }
    }

    /// True for the `result` message that terminates a run.
    pub fn is_result(&self) -> bool {
        matches!(self, SdkMessage::Result(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_permission_mode_wire_spelling() {
        assert_eq!(PermissionMode::Default.as_wire_str(), "default");
        assert_eq!(PermissionMode::AcceptEdits.as_wire_str(), "acceptEdits");
        assert_eq!(PermissionMode::Plan.as_wire_str(), "plan");
        assert_eq!(
            PermissionMode::BypassPermissions.as_wire_str(),
            "bypassPermissions"
        );
    }

    #[test]
    fn test_permission_mode_parses_both_spellings() {
        assert_eq!(
            PermissionMode::parse("accept_edits").unwrap(),
            PermissionMode::AcceptEdits
        );
        assert_eq!(
            PermissionMode::parse("bypassPermissions").unwrap(),
            PermissionMode::BypassPermissions
        );
        assert!(PermissionMode::parse("yolo").is_err());
    }

    #[test]
    fn test_agent_definition_validation() {
        let agent = AgentDefinition::new("reviews code", "You review code.");
        assert!(agent.validate("reviewer").is_ok());

        let empty_prompt = AgentDefinition::new("reviews code", "  ");
        let err = empty_prompt.validate("reviewer").unwrap_err();
        assert!(err.to_string().contains("prompt"));
    }

    #[test]
    fn test_builder_rejects_unknown_active_agent() {
        let result = AgentOptions::builder()
            .agent("reviewer", AgentDefinition::new("reviews", "Review."))
            .active_agent("writer")
            .build();
        assert!(matches!(result, Err(crate::Error::AgentNotFound(_))));
    }

    #[test]
    fn test_builder_rejects_active_agent_without_table() {
        let result = AgentOptions::builder().active_agent("writer").build();
        assert!(matches!(result, Err(crate::Error::NoAgentsConfigured)));
    }

    #[test]
    fn test_builder_rejects_conflicting_permission_options() {
        let callback = crate::permissions::permission_callback(|_ctx| async move {
            crate::permissions::PermissionResult::allow()
        });
        let result = AgentOptions::builder()
            .permission_prompt_tool("mcp__auth__prompt")
            .can_use_tool(callback)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let options = AgentOptions::builder().build().unwrap();
        assert_eq!(options.max_buffer_size, DEFAULT_MAX_BUFFER_SIZE);
        assert_eq!(
            options.control_request_timeout_ms,
            DEFAULT_CONTROL_REQUEST_TIMEOUT_MS
        );
        assert!(!options.needs_control_session());
    }

    #[test]
    fn test_needs_control_session_with_agents() {
        let options = AgentOptions::builder()
            .agent("reviewer", AgentDefinition::new("reviews", "Review."))
            .build()
            .unwrap();
        assert!(options.needs_control_session());
    }

    #[test]
    fn test_model_suggestions_capped_at_three() {
        let suggestions = model_suggestions("opsu");
        assert!(suggestions.len() <= 3);
        assert_eq!(suggestions[0], "opus");
    }

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("opus", "opus"), 0);
        assert_eq!(edit_distance("opsu", "opus"), 2);
        assert_eq!(edit_distance("", "abc"), 3);
    }

    #[test]
    fn test_sdk_message_classification() {
        let msg = SdkMessage::from_value(json!({
            "type": "assistant",
            "message": {"role": "assistant", "content": "hi"},
            "parent_tool_use_id": "toolu_1",
            "session_id": "s1"
        }))
        .unwrap();
        assert!(matches!(msg, SdkMessage::Assistant(_)));
        assert_eq!(msg.parent_tool_use_id(), Some("toolu_1"));
        assert_eq!(msg.session_id(), Some("s1"));
    }

    #[test]
    fn test_unknown_message_round_trips_verbatim() {
        let raw = json!({
            "type": "telemetry_v9",
            "payload": {"nested": [1, 2, 3]},
            "session_id": "s1"
        });
        let msg = SdkMessage::from_value(raw.clone()).unwrap();
        assert!(matches!(msg, SdkMessage::Unknown(_)));
        assert_eq!(msg.to_value(), raw);
    }

    #[test]
    fn test_result_message_preserves_unknown_subtype_and_fields() {
        let raw = json!({
            "type": "result",
            "subtype": "error_snapshot_v2",
            "duration_ms": 12,
            "num_turns": 1,
            "is_error": true,
            "snapshot_blob": {"k": "v"}
        });
        let msg = SdkMessage::from_value(raw.clone()).unwrap();
        let SdkMessage::Result(ref result) = msg else {
            panic!("expected result message");
        };
        assert_eq!(result.subtype, "error_snapshot_v2");
        assert_eq!(result.extra["snapshot_blob"], json!({"k": "v"}));
        assert_eq!(msg.to_value(), raw);
    }

    #[test]
    fn test_stream_event_envelope_preserves_metadata() {
        let raw = json!({
            "type": "stream_event",
            "uuid": "u1",
            "session_id": "s1",
            "parent_tool_use_id": "toolu_9",
            "event": {"type": "text_delta", "text": "hi"}
        });
        let msg = SdkMessage::from_value(raw.clone()).unwrap();
        let SdkMessage::StreamEvent(ref envelope) = msg else {
            panic!("expected stream event");
        };
        assert_eq!(envelope.uuid.as_deref(), Some("u1"));
        assert_eq!(envelope.parent_tool_use_id.as_deref(), Some("toolu_9"));
        assert_eq!(msg.to_value(), raw);
    }
}
