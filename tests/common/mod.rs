//! Shared test harness: an in-memory transport standing in for the Agent
//! CLI child process.
//!
//! Frames the client writes are parsed and recorded; tests inject inbound
//! lines and exit events to script the CLI side of the conversation.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use agent_host::transport::{Transport, TransportEvent, TransportStatus};

pub struct MockTransport {
    sent: StdMutex<Vec<Value>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: StdMutex<Option<mpsc::Receiver<TransportEvent>>>,
    status: StdMutex<TransportStatus>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(256);
        Arc::new(Self {
            sent: StdMutex::new(Vec::new()),
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            status: StdMutex::new(TransportStatus::Alive),
        })
    }

    /// All frames the client has written, as parsed JSON.
    pub fn sent_frames(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    /// Feed one inbound frame to the client.
    pub async fn inject_line(&self, frame: Value) {
        self.event_tx
            .send(TransportEvent::Line(frame.to_string()))
            .await
            .expect("reader gone");
    }

    /// Feed a raw (possibly invalid) line.
    pub async fn inject_raw_line(&self, line: &str) {
        self.event_tx
            .send(TransportEvent::Line(line.to_string()))
            .await
            .expect("reader gone");
    }

    /// Simulate the child exiting.
    pub async fn inject_exit(&self, code: Option<i32>, stderr: &str) {
        *self.status.lock().unwrap() = TransportStatus::Exited(code);
        self.event_tx
            .send(TransportEvent::Exit {
                code,
                stderr: stderr.to_string(),
            })
            .await
            .expect("reader gone");
    }

    /// Wait until the client has written a frame matching `predicate`.
    pub async fn wait_for_sent<F>(&self, predicate: F, timeout: Duration) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.sent.lock().unwrap().iter().find(|f| predicate(f)) {
                return frame.clone();
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "no matching frame within {timeout:?}; sent so far: {:#?}",
                    self.sent_frames()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait for an outbound `control_request` with the given subtype.
    pub async fn wait_for_request(&self, subtype: &str) -> Value {
        self.wait_for_sent(
            |f| f["type"] == "control_request" && f["request"]["subtype"] == subtype,
            Duration::from_secs(5),
        )
        .await
    }

    /// Wait for the `control_response` answering `request_id`.
    pub async fn wait_for_response(&self, request_id: &str) -> Value {
        let id = request_id.to_string();
        self.wait_for_sent(
            move |f| f["type"] == "control_response" && f["response"]["request_id"] == id.as_str(),
            Duration::from_secs(5),
        )
        .await
    }

    /// Every `control_response` written for `request_id`.
    pub fn responses_for(&self, request_id: &str) -> Vec<Value> {
        self.sent_frames()
            .into_iter()
            .filter(|f| {
                f["type"] == "control_response" && f["response"]["request_id"] == request_id
            })
            .collect()
    }

    /// Answer an outbound request with a success reply.
    pub async fn reply_success(&self, request: &Value, data: Value) {
        self.inject_line(json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request["request_id"],
                "response": data,
            },
        }))
        .await;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, line: &str) -> agent_host::Result<()> {
        if *self.status.lock().unwrap() != TransportStatus::Alive {
            return Err(agent_host::Error::connection("transport closed"));
        }
        let frame: Value = serde_json::from_str(line)
            .unwrap_or_else(|_| json!({"unparsed": line}));
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn end_input(&self) -> agent_host::Result<()> {
        Ok(())
    }

    async fn close(&self) -> agent_host::Result<()> {
        let mut status = self.status.lock().unwrap();
        if *status == TransportStatus::Alive {
            *status = TransportStatus::Exited(Some(0));
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    fn status(&self) -> TransportStatus {
        self.status.lock().unwrap().clone()
    }
}

/// Script the CLI side of the initialize handshake while the client
/// connects, then hand back the connected client.
pub async fn connect_client(
    options: agent_host::AgentOptions,
    mock: Arc<MockTransport>,
) -> agent_host::ControlClient {
    connect_client_with_info(
        options,
        mock,
        json!({"commands": [{"name": "plan"}], "outputStyle": {"current": "default"}}),
    )
    .await
}

pub async fn connect_client_with_info(
    options: agent_host::AgentOptions,
    mock: Arc<MockTransport>,
    server_info: Value,
) -> agent_host::ControlClient {
    let responder = {
        let mock = Arc::clone(&mock);
        tokio::spawn(async move {
            let init = mock.wait_for_request("initialize").await;
            mock.reply_success(&init, server_info).await;
        })
    };

    let client = agent_host::ControlClient::connect_with_transport(options, mock)
        .await
        .expect("connect failed");
    responder.await.expect("init responder failed");
    client
}
