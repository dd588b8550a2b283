//! Streaming event parser: delta classification and accumulation
//!
//! Partial-message streaming delivers a turn as a sequence of events:
//! `message_start`, then interleaved `content_block_*` and delta events,
//! then `message_stop`. This module classifies each event, accumulates text
//! and tool-input fragments per content-block index, and emits the final
//! assembled text when the turn stops.
//!
//! The accumulation rule is the streaming invariant the rest of the SDK
//! leans on: deltas concatenated by block index in arrival order equal the
//! final text emitted on `message_stop`, after which the accumulators reset.
//!
//! A turn is *complete* only when `message_stop` arrives with a terminal
//! stop reason (`end_turn`, `stop_sequence`, `max_tokens`). A `tool_use`
//! stop reason means the agent is about to run tools and keep going, so the
//! subscriber stays attached.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::types::{StreamEventEnvelope, Usage};

/// Stop reasons that end a response.
const TERMINAL_STOP_REASONS: &[&str] = &["end_turn", "stop_sequence", "max_tokens"];

/// True when `stop_reason` terminates the response (`tool_use` does not).
pub fn is_terminal_stop_reason(stop_reason: Option<&str>) -> bool {
    stop_reason.is_some_and(|r| TERMINAL_STOP_REASONS.contains(&r))
}

/// Routing metadata preserved from the `stream_event` wrapper.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventMeta {
    pub uuid: Option<String>,
    pub session_id: Option<String>,
    pub parent_tool_use_id: Option<String>,
}

impl EventMeta {
    pub fn from_envelope(envelope: &StreamEventEnvelope) -> Self {
        Self {
            uuid: envelope.uuid.clone(),
            session_id: envelope.session_id.clone(),
            parent_tool_use_id: envelope.parent_tool_use_id.clone(),
        }
    }
}

/// One classified streaming event, ready for subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    /// Turn opened; captures the serving model and initial usage
    MessageStart {
        model: Option<String>,
        usage: Usage,
        meta: EventMeta,
    },
    /// A content block opened at `index`
    ContentBlockStart {
        index: u64,
        block_type: String,
        meta: EventMeta,
    },
    /// Plain text fragment for the block at `index`
    TextDelta {
        index: u64,
        text: String,
        meta: EventMeta,
    },
    /// Thinking fragment for the block at `index`
    ThinkingDelta {
        index: u64,
        thinking: String,
        meta: EventMeta,
    },
    /// Raw tool-input JSON fragment for the block at `index`
    InputJsonDelta {
        index: u64,
        partial_json: String,
        meta: EventMeta,
    },
    /// A content block closed
    ContentBlockStop { index: u64, meta: EventMeta },
    /// Mid-turn update carrying the stop reason and usage deltas
    MessageDelta {
        stop_reason: Option<String>,
        usage: Usage,
        meta: EventMeta,
    },
    /// Turn closed; accumulators flushed into `final_text` / `tool_inputs`
    MessageStop {
        /// All text blocks concatenated by index in arrival order
        final_text: String,
        /// Accumulated raw tool-input JSON per block index
        tool_inputs: BTreeMap<u64, String>,
        /// The last stop reason seen this turn
        stop_reason: Option<String>,
        /// Whether this stop terminates the response
        is_terminal: bool,
        model: Option<String>,
        usage: Usage,
        meta: EventMeta,
    },
    /// An event type this SDK does not know; preserved as-is
    Unknown { event: Value, meta: EventMeta },
}

/// Stateful classifier for one session's streaming events.
///
/// Accumulator state spans a single assistant turn and resets on
/// `message_stop`.
#[derive(Debug, Default)]
pub struct EventParser {
    text: BTreeMap<u64, String>,
    tool_inputs: BTreeMap<u64, String>,
    model: Option<String>,
    usage: Usage,
    stop_reason: Option<String>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The text accumulated so far this turn.
    pub fn accumulated_text(&self) -> String {
        self.text.values().cloned().collect::<Vec<_>>().concat()
    }

    /// The last stop reason observed this turn.
    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    /// Classify a wrapped stream event.
    pub fn parse_envelope(&mut self, envelope: &StreamEventEnvelope) -> StreamUpdate {
        let meta = EventMeta::from_envelope(envelope);
        self.parse_event(&envelope.event, meta)
    }

    /// Classify one event, updating the accumulators.
    ///
    /// Accepts both the `content_block_delta` wrapper and bare delta events
    /// (`{"type": "text_delta", ...}`) as older CLI revisions emit them.
    pub fn parse_event(&mut self, event: &Value, meta: EventMeta) -> StreamUpdate {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();

        match event_type {
            "message_start" => {
                let message = event.get("message");
                self.model = message
                    .and_then(|m| m.get("model"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.usage = message
                    .and_then(|m| m.get("usage"))
                    .and_then(|u| serde_json::from_value(u.clone()).ok())
                    .unwrap_or_default();
                StreamUpdate::MessageStart {
                    model: self.model.clone(),
                    usage: self.usage.clone(),
                    meta,
                }
            }
            "content_block_start" => {
                let index = block_index(event);
                let block_type = event
                    .get("content_block")
                    .and_then(|b| b.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                StreamUpdate::ContentBlockStart {
                    index,
                    block_type,
                    meta,
                }
            }
            "content_block_delta" => {
                let index = block_index(event);
                let delta = event.get("delta").cloned().unwrap_or(Value::Null);
                self.classify_delta(&delta, index, meta)
            }
            // Bare delta shapes from older CLIs
            "text_delta" | "input_json_delta" | "thinking_delta" => {
                let index = block_index(event);
                self.classify_delta(event, index, meta)
            }
            "content_block_stop" => StreamUpdate::ContentBlockStop {
                index: block_index(event),
                meta,
            },
            "message_delta" => {
                if let Some(reason) = event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(usage) = event
                    .get("usage")
                    .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
                {
                    merge_usage(&mut self.usage, &usage);
                }
                StreamUpdate::MessageDelta {
                    stop_reason: self.stop_reason.clone(),
                    usage: self.usage.clone(),
                    meta,
                }
            }
            "message_stop" => {
                let final_text = self.accumulated_text();
                let tool_inputs = std::mem::take(&mut self.tool_inputs);
                let stop_reason = self.stop_reason.take();
                self.text.clear();

                StreamUpdate::MessageStop {
                    final_text,
                    tool_inputs,
                    is_terminal: is_terminal_stop_reason(stop_reason.as_deref()),
                    stop_reason,
                    model: self.model.clone(),
                    usage: std::mem::take(&mut self.usage),
                    meta,
                }
            }
            _ => StreamUpdate::Unknown {
                event: event.clone(),
                meta,
            },
        }
    }

    fn classify_delta(&mut self, delta: &Value, index: u64, meta: EventMeta) -> StreamUpdate {
        let delta_type = delta.get("type").and_then(Value::as_str).unwrap_or_default();
        match delta_type {
            "text_delta" => {
                let text = delta
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.text.entry(index).or_default().push_str(&text);
                StreamUpdate::TextDelta { index, text, meta }
            }
            "thinking_delta" => {
                let thinking = delta
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                StreamUpdate::ThinkingDelta {
                    index,
                    thinking,
                    meta,
                }
            }
            "input_json_delta" => {
                let partial = delta
                    .get("partial_json")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.tool_inputs
                    .entry(index)
                    .or_default()
                    .push_str(&partial);
                StreamUpdate::InputJsonDelta {
                    index,
                    partial_json: partial,
                    meta,
                }
            }
            _ => StreamUpdate::Unknown {
                event: delta.clone(),
                meta,
            },
        }
    }
}

fn block_index(event: &Value) -> u64 {
    event.get("index").and_then(Value::as_u64).unwrap_or(0)
}

fn merge_usage(into: &mut Usage, delta: &Usage) {
    if delta.input_tokens > 0 {
        into.input_tokens = delta.input_tokens;
    }
    if delta.output_tokens > 0 {
        into.output_tokens = delta.output_tokens;
    }
    if delta.cache_creation_input_tokens.is_some() {
        into.cache_creation_input_tokens = delta.cache_creation_input_tokens;
    }
    if delta.cache_read_input_tokens.is_some() {
        into.cache_read_input_tokens = delta.cache_read_input_tokens;
    }
}
