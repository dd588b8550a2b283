//! Control-protocol codec: typed frames and request-id generation
//!
//! Every frame on the wire is a single JSON object on its own line. Three
//! outer envelopes are control-plane, recognized by their `type` field:
//!
//! - `control_request` — carries a `request` payload with a `subtype`
//!   (`initialize`, `set_model`, `hook_callback`, ...). Flows both ways:
//!   the host sends runtime requests, the CLI sends callback invocations.
//! - `control_response` — answers a `control_request`, matched by
//!   `request_id`. `subtype` is `success` or `error`.
//! - `control_cancel_request` — asks the peer to cancel an in-flight
//!   request; never answered.
//!
//! Every other `type` is an SDK message and flows through
//! [`SdkMessage`](crate::types::SdkMessage) untouched, which is what keeps
//! unknown message types round-tripping byte-for-byte.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::SdkMessage;

// ============================================================================
// REQUEST IDS
// ============================================================================

/// Generates `req_<counter>_<8 hex chars>` ids, unique for the lifetime of
/// one Control Client.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    counter: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unique request id.
    pub fn next_id(&self) -> String {
        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        let suffix: String = {
            let mut rng = rand::thread_rng();
            (0..8)
                .map(|_| {
                    let n: u8 = rng.gen_range(0..16);
                    char::from_digit(n as u32, 16).unwrap()
                })
                .collect()
        };
        format!("req_{count}_{suffix}")
    }
}

// ============================================================================
// OUTBOUND REQUEST PAYLOADS
// ============================================================================

/// Payloads the host sends inside a `control_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequestPayload {
    /// The handshake: callback tables and server descriptors
    Initialize {
        /// Event name → matcher records with `hookCallbackIds`
        hooks: Option<Value>,
        /// In-process MCP server descriptors (`{name, version}` each)
        #[serde(rename = "sdkMcpServers", skip_serializing_if = "Option::is_none")]
        sdk_mcp_servers: Option<Value>,
        /// Named agent table
        #[serde(skip_serializing_if = "Option::is_none")]
        agents: Option<Value>,
        /// Whether the host answers `can_use_tool` requests
        #[serde(rename = "canUseTool", skip_serializing_if = "Option::is_none")]
        can_use_tool: Option<bool>,
    },
    /// Switch the served model
    SetModel { model: Option<String> },
    /// Switch the permission mode (wire spelling, e.g. `acceptEdits`)
    SetPermissionMode { mode: String },
    /// Activate a named agent
    SetAgent { agent: String },
    /// Cancel the current turn
    Interrupt,
    /// Query MCP server connection status
    McpStatus,
}

/// A full outbound `control_request` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundControlRequest {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub request_id: String,
    pub request: ControlRequestPayload,
}

impl OutboundControlRequest {
    pub fn new(request_id: impl Into<String>, request: ControlRequestPayload) -> Self {
        Self {
            frame_type: "control_request".to_string(),
            request_id: request_id.into(),
            request,
        }
    }

    /// Encode as one wire line (no trailing newline).
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// INBOUND FRAMES
// ============================================================================

/// A `control_request` sent by the CLI (callback invocation).
#[derive(Debug, Clone, PartialEq)]
pub struct InboundControlRequest {
    pub request_id: String,
    /// Raw request payload; `subtype` discriminates
    pub request: Value,
}

impl InboundControlRequest {
    /// The payload's `subtype`, empty if missing.
    pub fn subtype(&self) -> &str {
        self.request
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// A `control_response` matched against the pending table.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundControlResponse {
    pub request_id: String,
    /// `Ok(data)` for `subtype: success`, `Err(message)` for `error`
    pub outcome: Result<Value, String>,
}

/// One classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    ControlResponse(InboundControlResponse),
    ControlRequest(InboundControlRequest),
    ControlCancel { request_id: String },
    Sdk(SdkMessage),
}

impl InboundFrame {
    /// Decode one wire line.
    pub fn decode(line: &str) -> crate::Result<InboundFrame> {
        let raw: Value = serde_json::from_str(line)
            .map_err(|e| crate::Error::parse(format!("invalid JSON line: {e}")))?;
        Self::classify(raw)
    }

    /// Classify a decoded JSON object by its `type` field.
    pub fn classify(raw: Value) -> crate::Result<InboundFrame> {
        let frame_type = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match frame_type.as_str() {
            "control_response" => {
                let response = raw
                    .get("response")
                    .ok_or_else(|| crate::Error::protocol("control_response without response"))?;
                let request_id = response
                    .get("request_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| crate::Error::protocol("control_response without request_id"))?
                    .to_string();
                let subtype = response
                    .get("subtype")
                    .and_then(Value::as_str)
                    .unwrap_or_default();

                let outcome = match subtype {
                    "success" => {
                        // Some CLI revisions put the payload under
                        // `response`, others under `result`.
                        let data = response
                            .get("response")
                            .or_else(|| response.get("result"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        Ok(data)
                    }
                    "error" => {
                        let message = response
                            .get("error")
                            .map(|e| match e {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .unwrap_or_else(|| "unknown error".to_string());
                        Err(message)
                    }
                    other => {
                        return Err(crate::Error::protocol(format!(
                            "unexpected control_response subtype: {other}"
                        )));
                    }
                };

                Ok(InboundFrame::ControlResponse(InboundControlResponse {
                    request_id,
                    outcome,
                }))
            }
            "control_request" => {
                let request_id = raw
                    .get("request_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| crate::Error::protocol("control_request without request_id"))?
                    .to_string();
                let request = raw.get("request").cloned().unwrap_or(json!({}));
                Ok(InboundFrame::ControlRequest(InboundControlRequest {
                    request_id,
                    request,
                }))
            }
            "control_cancel_request" => {
                let request_id = raw
                    .get("request_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        crate::Error::protocol("control_cancel_request without request_id")
                    })?
                    .to_string();
                Ok(InboundFrame::ControlCancel { request_id })
            }
            _ => Ok(InboundFrame::Sdk(SdkMessage::from_value(raw)?)),
        }
    }
}

// ============================================================================
// OUTBOUND RESPONSES
// ============================================================================

/// Build a `control_response` success frame answering a CLI request.
pub fn success_response(request_id: &str, data: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": data,
        },
    })
}

/// Build a `control_response` error frame answering a CLI request.
pub fn error_response(request_id: &str, message: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": message,
        },
    })
}
