//! One-shot query path: no control features, just a stream of messages
//!
//! For sessions without hooks, permission callbacks, in-process tool
//! servers, or named agents, nothing bidirectional is needed: spawn the
//! Agent CLI, feed it the prompt, and parse stdout until the `result`
//! message (or process exit). `stream-json` output is forced regardless of
//! any host output-format preference.
//!
//! # Examples
//!
//! ```rust,no_run
//! use agent_host::{query, AgentOptions, SdkMessage};
//! use anyhow::Context;
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = AgentOptions::builder()
//!         .model("sonnet")
//!         .system_prompt("You are a helpful assistant")
//!         .build()?;
//!
//!     let mut stream = query("What's the capital of France?", &options)
//!         .await
//!         .context("failed to launch the agent CLI")?;
//!
//!     while let Some(message) = stream.next().await {
//!         if let SdkMessage::Assistant(raw) = message? {
//!             println!("{raw}");
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

use std::pin::Pin;
use std::sync::Arc;

use futures::stream::Stream;
use serde_json::Value;

use crate::transport::{SessionMode, SubprocessTransport, Transport, TransportEvent};
use crate::types::{AgentOptions, SdkMessage};

/// Stream of SDK messages from a one-shot run.
pub type MessageStream = Pin<Box<dyn Stream<Item = crate::Result<SdkMessage>> + Send>>;

/// Fire a single string prompt and stream the response messages.
///
/// The prompt is written to the child's stdin and input is closed; the
/// stream ends after the `result` message or when the process exits.
pub async fn query(prompt: &str, options: &AgentOptions) -> crate::Result<MessageStream> {
    let transport = SubprocessTransport::start(options, SessionMode::OneShot, false)?;
    transport.send(prompt).await?;
    transport.end_input().await?;
    Ok(stream_from_transport(Arc::new(transport)))
}

/// Fire a sequence of pre-built message objects (NDJSON input mode) and
/// stream the response messages.
pub async fn query_stream(
    messages: Vec<Value>,
    options: &AgentOptions,
) -> crate::Result<MessageStream> {
    let transport = SubprocessTransport::start(options, SessionMode::OneShot, true)?;
    for message in &messages {
        transport.send(&message.to_string()).await?;
    }
    transport.end_input().await?;
    Ok(stream_from_transport(Arc::new(transport)))
}

struct StreamState {
    transport: Arc<dyn Transport>,
    events: tokio::sync::mpsc::Receiver<TransportEvent>,
    finished: bool,
    saw_result: bool,
}

/// Turn transport events into a lazy message stream.
///
/// Termination: a `result` message ends the stream on the next poll; a
/// non-zero exit without one yields a process error first. Parse failures
/// are terminal, matching the control path.
fn stream_from_transport(transport: Arc<dyn Transport>) -> MessageStream {
    let events = transport
        .take_events()
        .expect("transport events taken exactly once at stream construction");
    let state = StreamState {
        transport,
        events,
        finished: false,
        saw_result: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        if state.finished {
            let _ = state.transport.close().await;
            return None;
        }

        while let Some(event) = state.events.recv().await {
            match event {
                TransportEvent::Line(line) => {
                    let parsed: crate::Result<SdkMessage> = serde_json::from_str::<Value>(&line)
                        .map_err(|e| crate::Error::parse(format!("invalid JSON line: {e}")))
                        .and_then(SdkMessage::from_value);
                    match parsed {
                        Ok(message) => {
                            if message.is_result() {
                                state.saw_result = true;
                                state.finished = true;
                            }
                            return Some((Ok(message), state));
                        }
                        Err(e) => {
                            state.finished = true;
                            return Some((Err(e), state));
                        }
                    }
                }
                TransportEvent::StderrLine(line) => {
                    log::debug!("agent stderr: {line}");
                }
                TransportEvent::Error(e) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                TransportEvent::Exit { code, stderr } => {
                    state.finished = true;
                    if !state.saw_result && code != Some(0) {
                        return Some((
                            Err(crate::Error::Process {
                                exit_code: code,
                                stderr,
                            }),
                            state,
                        ));
                    }
                    return None;
                }
            }
        }

        None
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[cfg(unix)]
    fn shell_options(script: &str) -> (AgentOptions, Vec<String>) {
        let options = AgentOptions::builder().build().unwrap();
        (options, vec!["-c".to_string(), script.to_string()])
    }

    #[cfg(unix)]
    fn shell_stream(script: &str) -> MessageStream {
        let (options, args) = shell_options(script);
        let transport = SubprocessTransport::start_raw("/bin/sh", args, &options).unwrap();
        stream_from_transport(Arc::new(transport))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stream_ends_after_result_message() {
        let mut stream = shell_stream(
            "printf '{\"type\":\"assistant\",\"message\":{}}\\n{\"type\":\"result\",\"subtype\":\"success\"}\\n{\"type\":\"assistant\",\"late\":true}\\n'",
        );

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, SdkMessage::Assistant(_)));

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.is_result());

        // Nothing after the result, even though the process printed more
        assert!(stream.next().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_without_result_is_a_process_error() {
        let mut stream = shell_stream("echo 'auth missing' >&2; exit 2");
        let err = stream.next().await.unwrap().unwrap_err();
        let crate::Error::Process { exit_code, stderr } = err else {
            panic!("expected process error, got {err:?}");
        };
        assert_eq!(exit_code, Some(2));
        assert!(stderr.contains("auth missing"));
        assert!(stream.next().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_without_result_just_ends() {
        let mut stream = shell_stream("printf '{\"type\":\"system\"}\\n'");
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, SdkMessage::System(_)));
        assert!(stream.next().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_json_is_terminal() {
        let mut stream = shell_stream("printf 'not json at all\\n{\"type\":\"system\"}\\n'");
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, crate::Error::Parse(_)));
        assert!(stream.next().await.is_none());
    }
}
