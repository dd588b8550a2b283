//! In-process tool server tests against the public API.

use serde_json::json;

use agent_host::{ToolResult, ToolServer, tool};

fn calculator() -> ToolServer {
    let add = tool("add", "Add two numbers")
        .param("a", "number")
        .param("b", "number")
        .build(|args| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(ToolResult::text((a + b).to_string()))
        });
    let divide = tool("divide", "Divide a by b")
        .param("a", "number")
        .param("b", "number")
        .build(|args| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            if b == 0.0 {
                return Ok(ToolResult::error("division by zero"));
            }
            Ok(ToolResult::text((a / b).to_string()))
        });
    ToolServer::new("calculator", "2.1.0", vec![add, divide])
}

#[tokio::test]
async fn initialize_advertises_server_info() {
    let server = calculator();
    let reply = server
        .handle_message(json!({"jsonrpc": "2.0", "id": 0, "method": "initialize"}))
        .await;
    assert_eq!(reply["result"]["serverInfo"]["name"], "calculator");
    assert_eq!(reply["result"]["serverInfo"]["version"], "2.1.0");
    assert!(reply["result"]["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn tools_list_includes_normalized_schemas() {
    let server = calculator();
    let reply = server
        .handle_message(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .await;
    let tools = reply["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 2);

    let add = tools.iter().find(|t| t["name"] == "add").unwrap();
    assert_eq!(add["inputSchema"]["type"], "object");
    assert_eq!(add["inputSchema"]["properties"]["a"]["type"], "number");
}

#[tokio::test]
async fn tools_call_success_and_domain_error() {
    let server = calculator();

    let reply = server
        .handle_message(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "add", "arguments": {"a": 20, "b": 22}},
        }))
        .await;
    assert_eq!(reply["result"]["content"][0]["text"], "42");

    // Domain errors travel as isError results, not protocol errors.
    let reply = server
        .handle_message(json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {"name": "divide", "arguments": {"a": 1, "b": 0}},
        }))
        .await;
    assert!(reply.get("error").is_none());
    assert_eq!(reply["result"]["isError"], json!(true));
    assert_eq!(reply["result"]["content"][0]["text"], "division by zero");
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let server = calculator();
    let reply = server
        .handle_message(json!({"jsonrpc": "2.0", "id": 4, "method": "prompts/list"}))
        .await;
    assert_eq!(reply["error"]["code"], -32601);
    assert_eq!(reply["error"]["message"], "Method not found: prompts/list");
    assert_eq!(reply["id"], 4);
}
