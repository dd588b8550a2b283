//! Hooks system for intercepting and controlling agent execution
//!
//! Hooks let the host observe and steer the Agent CLI at lifecycle points:
//! before and after tool use, on prompt submission, on stop. The host never
//! sends callbacks over the wire — it registers them locally and hands the
//! CLI stable string ids (`hook_0`, `hook_1`, ...). When the CLI wants a
//! hook to run it sends a `hook_callback` control request naming the id, and
//! the SDK dispatches to the registered function.
//!
//! # Examples
//!
//! ```rust,no_run
//! use agent_host::{AgentOptions, HookEvent, HookOutput};
//! use agent_host::hooks::{hook_callback, matcher};
//!
//! let guard = matcher(
//!     Some("Bash"),
//!     vec![hook_callback(|invocation| async move {
//!         let cmd = invocation.input["tool_input"]["command"]
//!             .as_str()
//!             .unwrap_or_default()
//!             .to_string();
//!         if cmd.contains("rm -rf") {
//!             return Ok(HookOutput::deny("destructive command"));
//!         }
//!         Ok(HookOutput::allow())
//!     })],
//!     None,
//! );
//!
//! let options = AgentOptions::builder()
//!     .hook(HookEvent::PreToolUse, guard)
//!     .build()
//!     .unwrap();
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

/// Matcher timeouts below this floor are raised to it.
pub const MIN_HOOK_TIMEOUT_MS: u64 = 1_000;

/// Matcher timeout applied when none is configured.
pub const DEFAULT_HOOK_TIMEOUT_MS: u64 = 60_000;

// ============================================================================
// ABORT SIGNAL
// ============================================================================

/// Cooperative cancellation flag shared between the Control Client and a
/// callback task.
///
/// The client sets the flag when the CLI sends `control_cancel_request`;
/// callbacks observe it either by polling [`is_aborted`](Self::is_aborted)
/// or by awaiting [`aborted`](Self::aborted). Tool execution is not
/// preempted — a late result is discarded after cancellation.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Debug, Default)]
struct AbortInner {
    flag: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter. Idempotent.
    pub fn abort(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True once cancellation has been requested.
    pub fn is_aborted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve when cancellation is requested. Returns immediately if the
    /// flag is already set.
    pub async fn aborted(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        loop {
            // Arm the waiter before re-checking the flag so an abort() that
            // lands in between still wakes us.
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}

// ============================================================================
// HOOK EVENTS
// ============================================================================

/// Lifecycle events the Agent CLI can fire hooks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    UserPromptSubmit,
    Stop,
    SubagentStop,
    PreCompact,
}

impl HookEvent {
    /// The wire-protocol event name.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::Stop => "Stop",
            HookEvent::SubagentStop => "SubagentStop",
            HookEvent::PreCompact => "PreCompact",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

// ============================================================================
// HOOK CALLBACKS
// ============================================================================

/// Context handed to a hook callback alongside its input.
#[derive(Clone, Debug, Default)]
pub struct HookContext {
    /// Cancellation signal; set when the CLI cancels the originating request
    pub signal: AbortSignal,
}

/// One hook invocation as dispatched from a `hook_callback` control request.
#[derive(Clone, Debug)]
pub struct HookInvocation {
    /// Raw hook input payload from the CLI (`hook_event_name`, `tool_name`,
    /// `tool_input`, ...)
    pub input: Value,
    /// Tool use the hook fired for, when applicable
    pub tool_use_id: Option<String>,
    /// Shared context (abort signal)
    pub context: HookContext,
}

/// Type alias for hook callback functions.
///
/// A callback takes the invocation and returns a [`HookOutput`]; errors are
/// converted to error control responses and never terminate the client.
pub type HookCallback = Arc<
    dyn Fn(HookInvocation) -> Pin<Box<dyn Future<Output = crate::Result<HookOutput>> + Send>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`HookCallback`].
pub fn hook_callback<F, Fut>(f: F) -> HookCallback
where
    F: Fn(HookInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<HookOutput>> + Send + 'static,
{
    Arc::new(move |invocation| Box::pin(f(invocation)))
}

// ============================================================================
// HOOK OUTPUT
// ============================================================================

/// Event-specific portion of a hook's reply.
///
/// Serialized camelCase; this is the shape the CLI consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSpecificOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_decision_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
}

/// Reply from a hook callback.
///
/// The wire form uses camelCase keys (`systemMessage`, `hookSpecificOutput`)
/// and `continue` for the reserved-word field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookOutput {
    /// `"block"` prevents the action the hook fired for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    /// Message surfaced to the user by the CLI
    #[serde(rename = "systemMessage", skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    /// Event-specific payload (permission decisions, input rewrites)
    #[serde(rename = "hookSpecificOutput", skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<HookSpecificOutput>,
    /// `false` stops the whole run
    #[serde(rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_: Option<bool>,
}

impl HookOutput {
    /// An empty output: continue normally with no modifications.
    pub fn pass() -> Self {
        Self::default()
    }

    /// Allow the tool call the hook fired for.
    pub fn allow() -> Self {
        Self {
            hook_specific_output: Some(HookSpecificOutput {
                hook_event_name: Some("PreToolUse".to_string()),
                permission_decision: Some("allow".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Allow, substituting the given tool input.
    pub fn allow_with_input(updated_input: Value) -> Self {
        Self {
            hook_specific_output: Some(HookSpecificOutput {
                hook_event_name: Some("PreToolUse".to_string()),
                permission_decision: Some("allow".to_string()),
                updated_input: Some(updated_input),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Deny the tool call with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            hook_specific_output: Some(HookSpecificOutput {
                hook_event_name: Some("PreToolUse".to_string()),
                permission_decision: Some("deny".to_string()),
                permission_decision_reason: Some(reason.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

// ============================================================================
// MATCHERS
// ============================================================================

/// Selects which tool names fire a set of hook callbacks.
///
/// `matcher: None` matches every tool. The timeout bounds each callback run;
/// values below 1 000 ms are applied as exactly 1 000 ms.
#[derive(Clone)]
pub struct HookMatcher {
    /// Tool-name pattern; `None` matches all
    pub matcher: Option<String>,
    /// Callbacks fired when the pattern matches
    pub hooks: Vec<HookCallback>,
    /// Per-callback timeout in milliseconds
    pub timeout_ms: Option<u64>,
}

impl HookMatcher {
    /// The timeout actually enforced: default 60 000 ms, floor 1 000 ms.
    pub fn effective_timeout(&self) -> Duration {
        let ms = self
            .timeout_ms
            .unwrap_or(DEFAULT_HOOK_TIMEOUT_MS)
            .max(MIN_HOOK_TIMEOUT_MS);
        Duration::from_millis(ms)
    }
}

impl std::fmt::Debug for HookMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookMatcher")
            .field("matcher", &self.matcher)
            .field("hooks", &format!("{} callbacks", self.hooks.len()))
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// Construct a [`HookMatcher`].
///
/// The standard way to build the hook table:
///
/// ```rust,ignore
/// options.hook(HookEvent::PreToolUse, matcher(Some("Bash"), vec![cb], Some(5_000)));
/// ```
pub fn matcher(
    pattern: Option<&str>,
    callbacks: Vec<HookCallback>,
    timeout_ms: Option<u64>,
) -> HookMatcher {
    HookMatcher {
        matcher: pattern.map(str::to_string),
        hooks: callbacks,
        timeout_ms,
    }
}

// ============================================================================
// CALLBACK REGISTRY
// ============================================================================

/// Bidirectional map between callbacks and the stable string ids the CLI
/// uses to name them.
///
/// Ids are `hook_<n>` in registration order. The registry is populated
/// before the initialize handshake and is append-only for the client's
/// lifetime.
#[derive(Default)]
pub struct HookRegistry {
    by_id: HashMap<String, HookCallback>,
    next_id: u64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback and return its stable id.
    ///
    /// Re-registering the same callback (by `Arc` identity) returns the id
    /// it already has.
    pub fn register(&mut self, callback: HookCallback) -> String {
        if let Some(existing) = self.id_for(&callback) {
            return existing;
        }
        let id = format!("hook_{}", self.next_id);
        self.next_id += 1;
        self.by_id.insert(id.clone(), callback);
        id
    }

    /// Look up a callback by the id the CLI sent.
    pub fn get(&self, id: &str) -> Option<HookCallback> {
        self.by_id.get(id).cloned()
    }

    /// Reverse lookup by callback identity.
    pub fn id_for(&self, callback: &HookCallback) -> Option<String> {
        let target = Arc::as_ptr(callback) as *const ();
        self.by_id
            .iter()
            .find(|(_, cb)| std::ptr::eq(Arc::as_ptr(cb) as *const (), target))
            .map(|(id, _)| id.clone())
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("callbacks", &self.by_id.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_callback() -> HookCallback {
        hook_callback(|_invocation| async move { Ok(HookOutput::pass()) })
    }

    #[test]
    fn test_matcher_timeout_default() {
        let m = matcher(Some("Bash"), vec![noop_callback()], None);
        assert_eq!(m.effective_timeout(), Duration::from_millis(60_000));
    }

    #[test]
    fn test_matcher_timeout_clamped_to_floor() {
        let m = matcher(Some("Bash"), vec![noop_callback()], Some(250));
        assert_eq!(m.effective_timeout(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_matcher_timeout_above_floor_kept() {
        let m = matcher(None, vec![noop_callback()], Some(1_100));
        assert_eq!(m.effective_timeout(), Duration::from_millis(1_100));
    }

    #[test]
    fn test_registry_assigns_sequential_ids() {
        let mut registry = HookRegistry::new();
        let a = registry.register(noop_callback());
        let b = registry.register(noop_callback());
        assert_eq!(a, "hook_0");
        assert_eq!(b, "hook_1");
        assert!(registry.get("hook_0").is_some());
        assert!(registry.get("hook_7").is_none());
    }

    #[test]
    fn test_registry_dedupes_by_identity() {
        let mut registry = HookRegistry::new();
        let cb = noop_callback();
        let first = registry.register(cb.clone());
        let second = registry.register(cb.clone());
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.id_for(&cb), Some(first));
    }

    #[test]
    fn test_hook_output_allow_wire_shape() {
        let output = HookOutput::allow();
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(
            value["hookSpecificOutput"]["permissionDecision"],
            json!("allow")
        );
        assert_eq!(
            value["hookSpecificOutput"]["hookEventName"],
            json!("PreToolUse")
        );
    }

    #[test]
    fn test_hook_output_deny_carries_reason() {
        let output = HookOutput::deny("nope");
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(
            value["hookSpecificOutput"]["permissionDecision"],
            json!("deny")
        );
        assert_eq!(
            value["hookSpecificOutput"]["permissionDecisionReason"],
            json!("nope")
        );
    }

    #[test]
    fn test_hook_output_continue_renamed() {
        let output = HookOutput {
            continue_: Some(false),
            ..Default::default()
        };
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["continue"], json!(false));
        assert!(value.get("continue_").is_none());
    }

    #[tokio::test]
    async fn test_abort_signal_wakes_waiter() {
        let signal = AbortSignal::new();
        assert!(!signal.is_aborted());

        let waiter = signal.clone();
        let handle = tokio::spawn(async move {
            waiter.aborted().await;
            true
        });

        // Give the waiter a moment to arm, then abort.
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.abort();
        let woke = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(woke);
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn test_abort_signal_already_set_returns_immediately() {
        let signal = AbortSignal::new();
        signal.abort();
        signal.abort(); // idempotent
        tokio::time::timeout(Duration::from_millis(50), signal.aborted())
            .await
            .unwrap();
    }
}
