//! Session facade: route between the one-shot path and the Control Client
//!
//! [`start_session`] inspects the configuration and picks the cheapest
//! transport that can serve it: a plain one-shot CLI run when no control
//! features are needed, or a full [`ControlClient`] when hooks, a
//! permission callback, in-process tool servers, or named agents are
//! configured. Control sessions always stream partial messages.

use std::pin::Pin;

use futures::stream::{Stream, StreamExt};

use crate::client::ControlClient;
use crate::subscribers::StreamItem;
use crate::types::AgentOptions;

/// Normalized event stream produced by [`Session::send_message`].
pub type SessionStream = Pin<Box<dyn Stream<Item = crate::Result<StreamItem>> + Send>>;

/// A started session: either path behind one handle.
pub enum Session {
    /// No control features; each message is its own CLI run
    OneShot { options: AgentOptions },
    /// Persistent bidirectional session
    Control(ControlClient),
}

/// Start a session for the given configuration.
///
/// The control path is selected iff the options carry hooks, a permission
/// callback, an in-process MCP server, or named agents.
pub async fn start_session(options: AgentOptions) -> crate::Result<Session> {
    if options.needs_control_session() {
        let client = ControlClient::connect(options).await?;
        Ok(Session::Control(client))
    } else {
        Ok(Session::OneShot { options })
    }
}

impl Session {
    /// Send a text prompt and get the lazy stream of events it produces.
    pub async fn send_message(&self, text: &str) -> crate::Result<SessionStream> {
        match self {
            Session::OneShot { options } => {
                let stream = crate::query(text, options).await?;
                Ok(Box::pin(stream.map(|item| item.map(StreamItem::Message))))
            }
            Session::Control(client) => {
                // Subscribe first so nothing between the write and the
                // subscription is missed.
                let stream = client.stream_messages();
                client.query(text, None).await?;
                Ok(Box::pin(stream.map(Ok)))
            }
        }
    }

    /// The underlying control client, when this session has one.
    pub fn control_client(&self) -> Option<&ControlClient> {
        match self {
            Session::Control(client) => Some(client),
            Session::OneShot { .. } => None,
        }
    }

    /// Close the session and terminate any child process.
    pub async fn close(self) -> crate::Result<()> {
        match self {
            Session::OneShot { .. } => Ok(()),
            Session::Control(client) => client.stop().await,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Session::OneShot { .. } => f.write_str("Session::OneShot"),
            Session::Control(_) => f.write_str("Session::Control"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{HookEvent, HookOutput, hook_callback, matcher};
    use crate::types::AgentDefinition;

    #[test]
    fn test_router_picks_oneshot_without_control_features() {
        let options = AgentOptions::builder().model("sonnet").build().unwrap();
        assert!(!options.needs_control_session());
    }

    #[test]
    fn test_router_picks_control_with_hooks() {
        let cb = hook_callback(|_| async move { Ok(HookOutput::pass()) });
        let options = AgentOptions::builder()
            .hook(HookEvent::PreToolUse, matcher(None, vec![cb], None))
            .build()
            .unwrap();
        assert!(options.needs_control_session());
    }

    #[test]
    fn test_router_picks_control_with_agents() {
        let options = AgentOptions::builder()
            .agent("reviewer", AgentDefinition::new("reviews", "Review."))
            .build()
            .unwrap();
        assert!(options.needs_control_session());
    }

    #[test]
    fn test_router_picks_control_with_sdk_server() {
        let options = AgentOptions::builder()
            .mcp_server(crate::tools::ToolServer::new("t", "1.0.0", vec![]))
            .build()
            .unwrap();
        assert!(options.needs_control_session());
    }
}
