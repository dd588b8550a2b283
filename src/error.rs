//! Error types for the Agent Host SDK

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the SDK
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to launch or talk to the Agent CLI process
    #[error("Connection error: {0}")]
    Connection(String),

    /// The Agent CLI process exited abnormally
    #[error("Agent CLI exited with code {exit_code:?}: {stderr}")]
    Process {
        /// Exit code of the child, if it exited normally
        exit_code: Option<i32>,
        /// Captured tail of the child's stderr
        stderr: String,
    },

    /// JSON decode failure on an inbound line
    #[error("Failed to decode message: {0}")]
    Parse(String),

    /// A line exceeded the configured buffer cap without a newline
    #[error("Line exceeded maximum buffer size of {limit} bytes")]
    BufferOverflow {
        /// The configured cap in bytes
        limit: usize,
    },

    /// Control protocol violation (unexpected subtype, unknown request id, ...)
    #[error("Control protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration or request arguments
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Model name not in the served set; carries up to 3 close matches
    #[error("Unknown model '{model}' (did you mean one of {suggestions:?}?)")]
    InvalidModel {
        /// The rejected model name
        model: String,
        /// Up to 3 edit-distance neighbours from the served set
        suggestions: Vec<String>,
    },

    /// A control request, hook, or permission callback timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Cancellation acknowledged
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// A runtime request arrived before the initialize handshake completed
    #[error("Session not initialized")]
    NotInitialized,

    /// A set_model / set_permission_mode is already in flight
    #[error("A model change is already in progress")]
    ModelChangeInProgress,

    /// set_agent named an agent that is not in the configured table
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// set_agent was called but no agents were configured
    #[error("No agents configured")]
    NoAgentsConfigured,

    /// The transport exited while requests were pending
    #[error("Transport exited: {0}")]
    TransportExit(String),

    /// Tool execution error (in-process MCP tools)
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error talking to the child process
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    /// Create a new parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Error::Cancelled(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new transport-exit error
    pub fn transport_exit(reason: impl Into<String>) -> Self {
        Error::TransportExit(reason.into())
    }

    /// True for errors that terminate the session (transport/process level)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::Process { .. }
                | Error::BufferOverflow { .. }
                | Error::TransportExit(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_connection() {
        let err = Error::connection("spawn failed");
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(err.to_string(), "Connection error: spawn failed");
    }

    #[test]
    fn test_error_process_carries_exit_code_and_stderr() {
        let err = Error::Process {
            exit_code: Some(1),
            stderr: "boom".to_string(),
        };
        assert!(err.to_string().contains("1"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_error_buffer_overflow_names_limit() {
        let err = Error::BufferOverflow { limit: 1024 * 1024 };
        assert!(err.to_string().contains("1048576"));
    }

    #[test]
    fn test_error_invalid_model_lists_suggestions() {
        let err = Error::InvalidModel {
            model: "opsu".to_string(),
            suggestions: vec!["opus".to_string()],
        };
        assert!(err.to_string().contains("opsu"));
        assert!(err.to_string().contains("opus"));
    }

    #[test]
    fn test_error_timeout() {
        let err = Error::timeout("control request timed out after 60000ms");
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.to_string().contains("60000"));
    }

    #[test]
    fn test_error_cancelled() {
        let err = Error::cancelled("Request cancelled by agent");
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn test_error_is_terminal() {
        assert!(Error::transport_exit("exit 0").is_terminal());
        assert!(Error::BufferOverflow { limit: 1 }.is_terminal());
        assert!(!Error::validation("bad mode").is_terminal());
        assert!(!Error::timeout("t").is_terminal());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn _returns_result() -> Result<i32> {
            Ok(42)
        }

        fn _returns_error() -> Result<i32> {
            Err(Error::NotInitialized)
        }
    }
}
