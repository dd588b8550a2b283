//! Permission callback types for `can_use_tool` control requests
//!
//! When the Agent CLI wants to run a tool it asks the host first (unless the
//! session runs in `bypass_permissions` mode). The host answers with an
//! allow/deny decision, optionally rewriting the tool input or attaching
//! permission updates.
//!
//! Wire serialization uses the protocol's camelCase keys (`updatedInput`,
//! `updatedPermissions`); the host-facing types stay snake_case.
//!
//! # Examples
//!
//! ```rust,no_run
//! use agent_host::permissions::{permission_callback, PermissionResult};
//!
//! let callback = permission_callback(|ctx| async move {
//!     if ctx.tool_name == "Bash" {
//!         PermissionResult::deny("shell access is disabled here")
//!     } else {
//!         PermissionResult::allow()
//!     }
//! });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::hooks::AbortSignal;

/// Context handed to the permission callback for one `can_use_tool` request.
#[derive(Clone, Debug)]
pub struct ToolPermissionContext {
    /// Name of the tool the CLI wants to run
    pub tool_name: String,
    /// The tool's proposed input
    pub tool_input: Value,
    /// Session the request belongs to
    pub session_id: Option<String>,
    /// Permission updates the CLI suggests the host could apply
    pub suggestions: Vec<Value>,
    /// Path that tripped a permission rule, when applicable
    pub blocked_path: Option<String>,
    /// Cancellation signal; set if the CLI cancels the request
    pub signal: AbortSignal,
}

/// Decision returned by the permission callback.
#[derive(Clone, Debug, PartialEq)]
pub enum PermissionResult {
    /// Let the tool run
    Allow {
        /// Replacement tool input; `None` keeps the original
        updated_input: Option<Value>,
        /// Permission rule updates to persist
        updated_permissions: Option<Value>,
    },
    /// Refuse the tool call
    Deny {
        /// Reason shown to the agent
        message: String,
        /// Also interrupt the current turn
        interrupt: bool,
    },
}

impl PermissionResult {
    /// Allow with the original input.
    pub fn allow() -> Self {
        PermissionResult::Allow {
            updated_input: None,
            updated_permissions: None,
        }
    }

    /// Allow, substituting the tool input.
    pub fn allow_with_input(updated_input: Value) -> Self {
        PermissionResult::Allow {
            updated_input: Some(updated_input),
            updated_permissions: None,
        }
    }

    /// Deny with a reason.
    pub fn deny(message: impl Into<String>) -> Self {
        PermissionResult::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    /// Deny and interrupt the current turn.
    pub fn deny_and_interrupt(message: impl Into<String>) -> Self {
        PermissionResult::Deny {
            message: message.into(),
            interrupt: true,
        }
    }

    /// Wire form for a `can_use_tool` control response.
    ///
    /// Allow always carries `updatedInput` — the rewritten input when the
    /// callback provided one, the original otherwise.
    pub fn to_wire_value(&self, original_input: &Value) -> Value {
        match self {
            PermissionResult::Allow {
                updated_input,
                updated_permissions,
            } => {
                let mut out = json!({
                    "behavior": "allow",
                    "updatedInput": updated_input.clone().unwrap_or_else(|| original_input.clone()),
                });
                if let Some(permissions) = updated_permissions {
                    out["updatedPermissions"] = permissions.clone();
                }
                out
            }
            PermissionResult::Deny { message, interrupt } => {
                let mut out = json!({
                    "behavior": "deny",
                    "message": message,
                });
                if *interrupt {
                    out["interrupt"] = json!(true);
                }
                out
            }
        }
    }

    /// Encode the decision as a `PreToolUse` hook output.
    ///
    /// Used by the permission-via-hook fallback for CLIs that never send
    /// `can_use_tool` frames.
    pub fn to_hook_output(&self, original_input: &Value) -> crate::hooks::HookOutput {
        match self {
            PermissionResult::Allow { updated_input, .. } => {
                crate::hooks::HookOutput::allow_with_input(
                    updated_input.clone().unwrap_or_else(|| original_input.clone()),
                )
            }
            PermissionResult::Deny { message, .. } => crate::hooks::HookOutput::deny(message.clone()),
        }
    }
}

/// Type alias for the permission callback.
pub type CanUseTool = Arc<
    dyn Fn(ToolPermissionContext) -> Pin<Box<dyn Future<Output = PermissionResult> + Send>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`CanUseTool`] callback.
pub fn permission_callback<F, Fut>(f: F) -> CanUseTool
where
    F: Fn(ToolPermissionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PermissionResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_wire_form_echoes_original_input() {
        let original = json!({"command": "ls"});
        let wire = PermissionResult::allow().to_wire_value(&original);
        assert_eq!(wire["behavior"], "allow");
        assert_eq!(wire["updatedInput"], original);
        assert!(wire.get("updatedPermissions").is_none());
    }

    #[test]
    fn test_allow_wire_form_uses_updated_input() {
        let original = json!({"command": "rm -rf /"});
        let wire = PermissionResult::allow_with_input(json!({"command": "ls"}))
            .to_wire_value(&original);
        assert_eq!(wire["updatedInput"], json!({"command": "ls"}));
    }

    #[test]
    fn test_deny_wire_form() {
        let wire = PermissionResult::deny("not allowed").to_wire_value(&json!({}));
        assert_eq!(wire["behavior"], "deny");
        assert_eq!(wire["message"], "not allowed");
        assert!(wire.get("interrupt").is_none());

        let wire = PermissionResult::deny_and_interrupt("stop").to_wire_value(&json!({}));
        assert_eq!(wire["interrupt"], json!(true));
    }

    #[test]
    fn test_hook_fallback_encoding() {
        let original = json!({"path": "a.txt"});
        let allow = PermissionResult::allow().to_hook_output(&original);
        let value = serde_json::to_value(&allow).unwrap();
        assert_eq!(value["hookSpecificOutput"]["permissionDecision"], "allow");
        assert_eq!(value["hookSpecificOutput"]["updatedInput"], original);

        let deny = PermissionResult::deny("no").to_hook_output(&original);
        let value = serde_json::to_value(&deny).unwrap();
        assert_eq!(value["hookSpecificOutput"]["permissionDecision"], "deny");
    }

    #[tokio::test]
    async fn test_permission_callback_wrapper() {
        let callback = permission_callback(|ctx| async move {
            if ctx.tool_name == "Bash" {
                PermissionResult::deny("no shell")
            } else {
                PermissionResult::allow()
            }
        });

        let ctx = ToolPermissionContext {
            tool_name: "Bash".to_string(),
            tool_input: json!({}),
            session_id: None,
            suggestions: vec![],
            blocked_path: None,
            signal: AbortSignal::new(),
        };
        let result = callback(ctx).await;
        assert!(matches!(result, PermissionResult::Deny { .. }));
    }
}
