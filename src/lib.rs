//! # Agent Host SDK - Rust Implementation
//!
//! A streaming-first Rust SDK for embedding and driving an external LLM
//! agent runtime (the "Agent CLI") as a long-lived subprocess.
//!
//! ## Overview
//!
//! The SDK mediates between a host application and the Agent CLI over a
//! newline-delimited JSON duplex stream on the child's stdin/stdout. It
//! exposes two interaction modes:
//!
//! - a **one-shot query path** — fire a prompt, stream messages back — and
//! - a **persistent control session** with runtime configuration, hooks,
//!   permission callbacks, in-process MCP tool servers, cancellation, model
//!   switching, and partial-message streaming.
//!
//! ## Key Features
//!
//! - **Subprocess transport**: the CLI runs as a supervised child; line
//!   framing, stderr capture, and exit handling are built in
//! - **Bidirectional control protocol**: hooks and permission checks run in
//!   the host and answer the CLI over correlated control frames
//! - **In-process tools**: serve an MCP tool catalogue without spawning
//!   another process
//! - **Partial streaming**: text and tool-input deltas, accumulated and
//!   verified against the final message
//! - **Runtime switches**: model, permission mode, and named agents can
//!   change mid-session
//!
//! ## Two Interaction Modes
//!
//! ### 1. Simple Query Function (`query()`)
//! For single-turn interactions without control features:
//!
//! ```rust,no_run
//! use agent_host::{query, AgentOptions, SdkMessage};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = AgentOptions::builder()
//!         .model("sonnet")
//!         .system_prompt("You are a helpful assistant")
//!         .build()?;
//!
//!     let mut stream = query("What's the capital of France?", &options).await?;
//!
//!     while let Some(message) = stream.next().await {
//!         match message? {
//!             SdkMessage::Assistant(raw) => println!("{raw}"),
//!             SdkMessage::Result(result) => println!("cost: {:?}", result.total_cost_usd),
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ### 2. Control Client (`ControlClient`)
//! For sessions with hooks, permission callbacks, tools, or agents:
//!
//! ```rust,no_run
//! use agent_host::{AgentOptions, ControlClient, HookEvent, HookOutput};
//! use agent_host::hooks::{hook_callback, matcher};
//! use anyhow::Context;
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let guard = matcher(
//!         Some("Bash"),
//!         vec![hook_callback(|_invocation| async move { Ok(HookOutput::allow()) })],
//!         None,
//!     );
//!     let options = AgentOptions::builder()
//!         .model("sonnet")
//!         .hook(HookEvent::PreToolUse, guard)
//!         .build()?;
//!
//!     let client = ControlClient::connect(options)
//!         .await
//!         .context("failed to launch the agent CLI")?;
//!     let mut stream = client.stream_messages();
//!
//!     client.query("Run the test suite", None).await?;
//!     while let Some(item) = stream.next().await {
//!         println!("{item:?}");
//!     }
//!
//!     client.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The SDK is organized into modules in dependency order, leaves first:
//!
//! - **transport**: child process lifetime, line framing, stderr, exit
//! - **protocol**: typed control frames and request-id generation
//! - **events**: streaming-delta classification and accumulation
//! - **hooks**: lifecycle callbacks, matchers, the callback registry
//! - **permissions**: the `can_use_tool` callback and its wire encoding
//! - **tools**: in-process MCP tool servers
//! - **pending**: correlation tables for requests and callback tasks
//! - **subscribers**: message fan-out with pre-subscribe buffering
//! - **client**: the Control Client state machine composing all of the above
//! - **query**: the one-shot path
//! - **session**: the facade that routes between the two paths

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Control Client state machine: handshake, routing, callbacks, failure.
mod client;

/// Error types and conversions used across all public APIs.
mod error;

/// Streaming event classification and per-turn accumulators.
pub mod events;

/// Hooks: lifecycle callbacks, matchers, stable callback ids.
pub mod hooks;

/// Correlation tables for outstanding requests and callback tasks.
mod pending;

/// Permission callback types and wire encoding.
pub mod permissions;

/// Typed control-protocol frames and request ids.
pub mod protocol;

/// One-shot query path.
mod query;

/// Session facade routing one-shot vs control.
mod session;

/// Subscriber fan-out with pre-subscribe buffering and FIFO promotion.
mod subscribers;

/// In-process MCP tool servers.
mod tools;

/// Subprocess transport and CLI argument construction.
pub mod transport;

/// Session configuration and the SDK message model.
mod types;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

// --- Core Client API ---

pub use client::{ControlClient, STREAM_CLOSE_TIMEOUT_ENV};
pub use query::{MessageStream, query, query_stream};
pub use session::{Session, SessionStream, start_session};

// --- Errors ---

pub use error::{Error, Result};

// --- Streaming ---

pub use events::{EventMeta, EventParser, StreamUpdate};
pub use subscribers::StreamItem;

// --- Hooks & Permissions ---

pub use hooks::{
    AbortSignal, HookCallback, HookEvent, HookInvocation, HookMatcher, HookOutput,
    HookSpecificOutput, hook_callback, matcher,
};
pub use permissions::{CanUseTool, PermissionResult, ToolPermissionContext, permission_callback};

// --- Tool System ---

pub use tools::{Tool, ToolBuilder, ToolContent, ToolResult, ToolServer, tool};

// --- Core Types ---

pub use types::{
    AgentDefinition, AgentOptions, AgentOptionsBuilder, McpServerConfig, PermissionMode,
    ResultMessage, SdkMessage, StreamEventEnvelope, Usage,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types and functions.
/// Import with `use agent_host::prelude::*;` for typical usage.
pub mod prelude {
    pub use crate::{
        AgentOptions, AgentOptionsBuilder, ControlClient, Error, HookEvent, HookOutput,
        PermissionMode, PermissionResult, Result, SdkMessage, Session, StreamItem, StreamUpdate,
        Tool, ToolResult, ToolServer, hook_callback, matcher, permission_callback, query,
        start_session, tool,
    };
}
