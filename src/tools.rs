//! # Tool System for the Agent Host SDK
//!
//! In-process tools the Agent CLI can call without spawning anything. A
//! [`Tool`] couples metadata (name, description, input schema) with an async
//! handler; a [`ToolServer`] groups tools under a server name and speaks the
//! MCP JSON-RPC surface (`initialize`, `tools/list`, `tools/call`) when the
//! CLI routes an `mcp_message` control request at it.
//!
//! ## Schema Flexibility
//!
//! Tool input schemas accept two notations and normalize both to JSON
//! Schema:
//!
//! - **Simple notation**: `{"location": "string", "count": "integer"}`
//! - **Full JSON Schema**: any object that already has `"type"` and
//!   `"properties"` is passed through untouched
//!
//! ## Examples
//!
//! ```rust,no_run
//! use agent_host::{tool, ToolResult, ToolServer};
//! use serde_json::json;
//!
//! let weather = tool("get_weather", "Get current weather for a location")
//!     .param("location", "string")
//!     .build(|args| async move {
//!         let location = args["location"].as_str().unwrap_or("Unknown").to_string();
//!         Ok(ToolResult::text(format!("22C in {location}")))
//!     });
//!
//! let server = ToolServer::new("weather", "1.0.0", vec![weather]);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value, json};

/// MCP protocol revision this server advertises.
const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

// ============================================================================
// TOOL RESULTS
// ============================================================================

/// One content entry in a tool result.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolContent {
    /// Plain text payload
    Text { text: String },
    /// Base64 image payload with its MIME type
    Image { data: String, mime_type: String },
}

impl ToolContent {
    fn to_wire_value(&self) -> Value {
        match self {
            ToolContent::Text { text } => json!({"type": "text", "text": text}),
            ToolContent::Image { data, mime_type } => {
                json!({"type": "image", "data": data, "mimeType": mime_type})
            }
        }
    }
}

/// What a tool handler returns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolResult {
    /// Content entries shown to the agent
    pub content: Vec<ToolContent>,
    /// Marks the result as an error without failing the RPC
    pub is_error: bool,
}

impl ToolResult {
    /// A single-text success result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// A single-text error result (`isError: true` on the wire).
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    fn to_wire_value(&self) -> Value {
        let mut out = json!({
            "content": self.content.iter().map(ToolContent::to_wire_value).collect::<Vec<_>>(),
        });
        if self.is_error {
            out["isError"] = json!(true);
        }
        out
    }
}

// ============================================================================
// TOOL DEFINITION
// ============================================================================

/// Type alias for tool handler functions.
///
/// Handlers take the JSON argument map and return a [`ToolResult`]; an `Err`
/// is reflected to the agent as an `isError` result, never as a protocol
/// failure.
pub type ToolHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = crate::Result<ToolResult>> + Send>>
        + Send
        + Sync,
>;

/// An in-process tool: metadata plus its async handler.
///
/// Tools are immutable once built; cloning shares the handler through the
/// `Arc`.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    input_schema: Value,
    handler: ToolHandler,
}

impl Tool {
    /// Create a tool from parts. `input_schema` may be simple notation or
    /// full JSON Schema; see the module docs.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<ToolResult>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: normalize_schema(input_schema),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// The tool's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The description sent to the agent.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The normalized JSON Schema for the tool's input.
    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Run the handler.
    pub async fn execute(&self, args: Value) -> crate::Result<ToolResult> {
        (self.handler)(args).await
    }

    /// The `tools/list` entry for this tool.
    fn to_listing(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish()
    }
}

/// Normalize simple `{"param": "type"}` notation into JSON Schema. Objects
/// that already carry `type`/`properties` pass through untouched.
fn normalize_schema(schema: Value) -> Value {
    let Value::Object(map) = &schema else {
        return schema;
    };

    if map.contains_key("type") && map.contains_key("properties") {
        return schema;
    }

    let mut properties = Map::new();
    let mut required = Vec::new();

    for (key, value) in map {
        match value {
            // "location": "string"
            Value::String(type_name) => {
                properties.insert(key.clone(), json!({"type": type_name}));
                required.push(json!(key));
            }
            // "count": {"type": "integer", "description": ...}
            Value::Object(spec) => {
                let optional = spec
                    .get("optional")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let mut spec = spec.clone();
                spec.remove("optional");
                properties.insert(key.clone(), Value::Object(spec));
                if !optional {
                    required.push(json!(key));
                }
            }
            other => {
                properties.insert(key.clone(), other.clone());
                required.push(json!(key));
            }
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

// ============================================================================
// TOOL BUILDER
// ============================================================================

/// Builder returned by [`tool()`].
pub struct ToolBuilder {
    name: String,
    description: String,
    schema: Map<String, Value>,
}

impl ToolBuilder {
    /// Add a required parameter in simple notation.
    pub fn param(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.schema
            .insert(name.into(), Value::String(type_name.into()));
        self
    }

    /// Add a parameter with a full schema fragment.
    pub fn param_schema(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.schema.insert(name.into(), schema);
        self
    }

    /// Attach the handler and produce the tool.
    pub fn build<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<ToolResult>> + Send + 'static,
    {
        Tool::new(
            self.name,
            self.description,
            Value::Object(self.schema),
            handler,
        )
    }
}

/// Start building a tool.
///
/// ```rust,no_run
/// use agent_host::{tool, ToolResult};
///
/// let multiply = tool("multiply", "Multiply two numbers")
///     .param("a", "number")
///     .param("b", "number")
///     .build(|args| async move {
///         let a = args["a"].as_f64().unwrap_or(0.0);
///         let b = args["b"].as_f64().unwrap_or(0.0);
///         Ok(ToolResult::text((a * b).to_string()))
///     });
/// ```
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder {
        name: name.into(),
        description: description.into(),
        schema: Map::new(),
    }
}

// ============================================================================
// TOOL SERVER
// ============================================================================

/// An in-process MCP server: a named, versioned tool catalogue.
///
/// The Agent CLI addresses it by name through `mcp_message` control
/// requests; [`handle_message`](Self::handle_message) answers the JSON-RPC
/// methods MCP defines. Handler failures become `isError` results; only an
/// unknown method produces a JSON-RPC `error` object, and even that is
/// embedded in the MCP reply rather than failing the control response.
pub struct ToolServer {
    name: String,
    version: String,
    tools: Vec<Tool>,
}

impl ToolServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>, tools: Vec<Tool>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tools,
        }
    }

    /// The server name the CLI routes by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The advertised server version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Names of all registered tools.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Look up a tool by name.
    pub fn get_tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Answer one JSON-RPC message addressed at this server.
    pub async fn handle_message(&self, message: Value) -> Value {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match method {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "serverInfo": {"name": self.name, "version": self.version},
                    "capabilities": {"tools": {}},
                },
            }),
            "tools/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "tools": self.tools.iter().map(Tool::to_listing).collect::<Vec<_>>(),
                },
            }),
            "tools/call" => {
                let params = message.get("params").cloned().unwrap_or(json!({}));
                let tool_name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

                let result = match self.get_tool(tool_name) {
                    Some(tool) => match tool.execute(arguments).await {
                        Ok(result) => result,
                        // Handler failures are results, not protocol errors
                        Err(e) => ToolResult::error(e.to_string()),
                    },
                    None => ToolResult::error(format!("Tool not found: {tool_name}")),
                };

                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": result.to_wire_value(),
                })
            }
            other => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": -32601,
                    "message": format!("Method not found: {other}"),
                },
            }),
        }
    }
}

impl std::fmt::Debug for ToolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServer")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("tools", &self.tool_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_tool() -> Tool {
        tool("echo", "Echo the input back")
            .param("text", "string")
            .build(|args| async move {
                let text = args["text"].as_str().unwrap_or_default().to_string();
                Ok(ToolResult::text(text))
            })
    }

    fn failing_tool() -> Tool {
        tool("fail", "Always fails").build(|_args| async move {
            Err(crate::Error::tool("deliberate failure"))
        })
    }

    #[test]
    fn test_simple_schema_normalization() {
        let t = echo_tool();
        let schema = t.input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["text"]["type"], "string");
        assert_eq!(schema["required"], json!(["text"]));
    }

    #[test]
    fn test_full_schema_passthrough() {
        let schema = json!({
            "type": "object",
            "properties": {"q": {"type": "string"}},
            "required": []
        });
        let t = Tool::new("search", "Search", schema.clone(), |_args| async move {
            Ok(ToolResult::text(""))
        });
        assert_eq!(t.input_schema(), &schema);
    }

    #[test]
    fn test_optional_param_excluded_from_required() {
        let schema = json!({
            "query": "string",
            "limit": {"type": "integer", "optional": true}
        });
        let normalized = normalize_schema(schema);
        assert_eq!(normalized["required"], json!(["query"]));
        assert!(normalized["properties"]["limit"].get("optional").is_none());
    }

    #[tokio::test]
    async fn test_server_initialize() {
        let server = ToolServer::new("calc", "1.2.0", vec![echo_tool()]);
        let reply = server
            .handle_message(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
            .await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["serverInfo"]["name"], "calc");
        assert_eq!(reply["result"]["serverInfo"]["version"], "1.2.0");
    }

    #[tokio::test]
    async fn test_server_tools_list() {
        let server = ToolServer::new("calc", "1.0.0", vec![echo_tool(), failing_tool()]);
        let reply = server
            .handle_message(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await;
        let tools = reply["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "echo");
        assert!(tools[0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn test_server_tools_call_success() {
        let server = ToolServer::new("calc", "1.0.0", vec![echo_tool()]);
        let reply = server
            .handle_message(json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "echo", "arguments": {"text": "hi"}}
            }))
            .await;
        assert_eq!(reply["result"]["content"][0]["text"], "hi");
        assert!(reply["result"].get("isError").is_none());
    }

    #[tokio::test]
    async fn test_server_tools_call_handler_error_is_reflected_not_raised() {
        let server = ToolServer::new("calc", "1.0.0", vec![failing_tool()]);
        let reply = server
            .handle_message(json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": {"name": "fail", "arguments": {}}
            }))
            .await;
        // The RPC itself succeeds; the failure lives in the result
        assert!(reply.get("error").is_none());
        assert_eq!(reply["result"]["isError"], json!(true));
        assert!(
            reply["result"]["content"][0]["text"]
                .as_str()
                .unwrap()
                .contains("deliberate failure")
        );
    }

    #[tokio::test]
    async fn test_server_unknown_tool() {
        let server = ToolServer::new("calc", "1.0.0", vec![]);
        let reply = server
            .handle_message(json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": {"name": "nope", "arguments": {}}
            }))
            .await;
        assert_eq!(reply["result"]["isError"], json!(true));
    }

    #[tokio::test]
    async fn test_server_unknown_method() {
        let server = ToolServer::new("calc", "1.0.0", vec![]);
        let reply = server
            .handle_message(json!({"jsonrpc": "2.0", "id": 6, "method": "resources/list"}))
            .await;
        assert_eq!(reply["error"]["code"], -32601);
        assert_eq!(reply["error"]["message"], "Method not found: resources/list");
    }
}
