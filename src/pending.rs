//! Pending table: outstanding control requests and in-flight callback tasks
//!
//! Two maps keyed by request id. Outbound entries hold the reply channel for
//! a control request the host sent; callback entries track the supervised
//! task spawned for a control request the CLI sent. Entries are removed
//! exactly once — on reply, on deadline, on cancel, or on transport exit —
//! and removal is idempotent under the race between a reply arriving and
//! the task's own completion.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::hooks::AbortSignal;

/// What an outbound control request was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Initialize,
    SetModel,
    SetPermissionMode,
    SetAgent,
    Interrupt,
    OutboundControl,
}

/// What kind of callback a CLI request dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Hook,
    Permission,
    ToolCall,
    McpRequest,
}

/// One outstanding control request the host sent.
#[derive(Debug)]
pub struct OutboundEntry {
    pub kind: RequestKind,
    pub sender: oneshot::Sender<crate::Result<Value>>,
    pub deadline: Instant,
}

/// One in-flight callback task serving a CLI request.
#[derive(Debug)]
pub struct CallbackEntry {
    pub kind: CallbackKind,
    pub task: JoinHandle<()>,
    pub signal: AbortSignal,
    pub cancelled: bool,
    pub tool_use_id: Option<String>,
}

/// The two correlation maps, owned by the Control Client.
#[derive(Debug, Default)]
pub struct PendingTable {
    outbound: HashMap<String, OutboundEntry>,
    callbacks: HashMap<String, CallbackEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Outbound requests
    // ------------------------------------------------------------------

    /// Register an outbound request. A duplicate id is an invariant
    /// violation: ids are unique for the client's lifetime.
    pub fn insert_outbound(
        &mut self,
        request_id: &str,
        kind: RequestKind,
        sender: oneshot::Sender<crate::Result<Value>>,
        timeout: Duration,
    ) -> crate::Result<()> {
        if self.outbound.contains_key(request_id) {
            return Err(crate::Error::protocol(format!(
                "duplicate outbound request id: {request_id}"
            )));
        }
        self.outbound.insert(
            request_id.to_string(),
            OutboundEntry {
                kind,
                sender,
                deadline: Instant::now() + timeout,
            },
        );
        Ok(())
    }

    /// Resolve an outbound request with the CLI's reply. Returns `false` if
    /// the entry was already removed (deadline fired, transport exit), in
    /// which case the reply is dropped.
    pub fn complete_outbound(&mut self, request_id: &str, result: crate::Result<Value>) -> bool {
        match self.outbound.remove(request_id) {
            Some(entry) => {
                // The caller may have given up; a closed channel is fine.
                let _ = entry.sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Remove an outbound entry without resolving it (caller-side timeout).
    pub fn remove_outbound(&mut self, request_id: &str) -> Option<OutboundEntry> {
        self.outbound.remove(request_id)
    }

    /// Whether a request of `kind` is currently outstanding.
    pub fn has_outbound_of_kind(&self, kind: RequestKind) -> bool {
        self.outbound.values().any(|e| e.kind == kind)
    }

    /// The wall-clock deadline recorded for a pending request.
    pub fn deadline_of(&self, request_id: &str) -> Option<Instant> {
        self.outbound.get(request_id).map(|e| e.deadline)
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Transport exit: every outstanding caller gets a transport-exit error.
    /// No reply is lost and none is duplicated — entries drain exactly once.
    pub fn fail_all_outbound(&mut self, reason: &str) -> usize {
        let drained: Vec<OutboundEntry> = self.outbound.drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.sender.send(Err(crate::Error::transport_exit(reason)));
        }
        count
    }

    // ------------------------------------------------------------------
    // Inbound callback tasks
    // ------------------------------------------------------------------

    /// Track a spawned callback task.
    pub fn insert_callback(
        &mut self,
        request_id: &str,
        kind: CallbackKind,
        task: JoinHandle<()>,
        signal: AbortSignal,
        tool_use_id: Option<String>,
    ) {
        self.callbacks.insert(
            request_id.to_string(),
            CallbackEntry {
                kind,
                task,
                signal,
                cancelled: false,
                tool_use_id,
            },
        );
    }

    /// Mark a callback cancelled and fire its abort signal. Returns the
    /// signal if the callback was still in flight.
    pub fn cancel_callback(&mut self, request_id: &str) -> Option<AbortSignal> {
        let entry = self.callbacks.get_mut(request_id)?;
        entry.cancelled = true;
        entry.signal.abort();
        Some(entry.signal.clone())
    }

    /// Whether the callback was cancelled before completing.
    pub fn callback_cancelled(&self, request_id: &str) -> bool {
        self.callbacks
            .get(request_id)
            .is_some_and(|e| e.cancelled)
    }

    /// Remove a finished callback. Idempotent: the normal-completion path
    /// and the cancellation path can both try, only the first wins.
    pub fn remove_callback(&mut self, request_id: &str) -> Option<CallbackEntry> {
        self.callbacks.remove(request_id)
    }

    pub fn callbacks_len(&self) -> usize {
        self.callbacks.len()
    }

    /// Transport exit: abort every in-flight callback task.
    pub fn abort_all_callbacks(&mut self) -> usize {
        let drained: Vec<CallbackEntry> = self.callbacks.drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            entry.signal.abort();
            entry.task.abort();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_task() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn test_outbound_completed_exactly_once() {
        let mut table = PendingTable::new();
        let (tx, rx) = oneshot::channel();
        table
            .insert_outbound("req_1", RequestKind::Interrupt, tx, Duration::from_secs(60))
            .unwrap();

        assert!(table.complete_outbound("req_1", Ok(json!({"ok": true}))));
        // Second completion finds nothing
        assert!(!table.complete_outbound("req_1", Ok(json!({"ok": false}))));

        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["ok"], json!(true));
        assert_eq!(table.outbound_len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_outbound_id_rejected() {
        let mut table = PendingTable::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        table
            .insert_outbound("req_1", RequestKind::Interrupt, tx1, Duration::from_secs(1))
            .unwrap();
        let err = table
            .insert_outbound("req_1", RequestKind::Interrupt, tx2, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, crate::Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_transport_exit_fails_every_pending_caller() {
        let mut table = PendingTable::new();
        let mut receivers = Vec::new();
        for i in 0..5 {
            let (tx, rx) = oneshot::channel();
            table
                .insert_outbound(
                    &format!("req_{i}"),
                    RequestKind::OutboundControl,
                    tx,
                    Duration::from_secs(60),
                )
                .unwrap();
            receivers.push(rx);
        }

        assert_eq!(table.fail_all_outbound("exit code 1"), 5);
        assert_eq!(table.outbound_len(), 0);

        for rx in receivers {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err, crate::Error::TransportExit(_)));
            assert!(err.to_string().contains("exit code 1"));
        }
    }

    #[tokio::test]
    async fn test_mutating_request_detection() {
        let mut table = PendingTable::new();
        let (tx, _rx) = oneshot::channel();
        table
            .insert_outbound("req_m", RequestKind::SetModel, tx, Duration::from_secs(60))
            .unwrap();
        assert!(table.has_outbound_of_kind(RequestKind::SetModel));
        assert!(!table.has_outbound_of_kind(RequestKind::Interrupt));
        assert!(table.deadline_of("req_m").unwrap() > Instant::now());

        table.remove_outbound("req_m");
        assert!(!table.has_outbound_of_kind(RequestKind::SetModel));
    }

    #[tokio::test]
    async fn test_cancel_callback_sets_flag_and_signal() {
        let mut table = PendingTable::new();
        let signal = AbortSignal::new();
        table.insert_callback(
            "req_perm",
            CallbackKind::Permission,
            noop_task(),
            signal.clone(),
            None,
        );

        assert!(!table.callback_cancelled("req_perm"));
        let returned = table.cancel_callback("req_perm").unwrap();
        assert!(returned.is_aborted());
        assert!(signal.is_aborted());
        assert!(table.callback_cancelled("req_perm"));

        // Unknown ids are a no-op
        assert!(table.cancel_callback("req_missing").is_none());
    }

    #[tokio::test]
    async fn test_remove_callback_idempotent() {
        let mut table = PendingTable::new();
        table.insert_callback(
            "req_h",
            CallbackKind::Hook,
            noop_task(),
            AbortSignal::new(),
            Some("toolu_1".to_string()),
        );

        let entry = table.remove_callback("req_h").unwrap();
        assert_eq!(entry.kind, CallbackKind::Hook);
        assert_eq!(entry.tool_use_id.as_deref(), Some("toolu_1"));
        assert!(table.remove_callback("req_h").is_none());
    }

    #[tokio::test]
    async fn test_abort_all_callbacks() {
        let mut table = PendingTable::new();
        let signals: Vec<AbortSignal> = (0..3).map(|_| AbortSignal::new()).collect();
        for (i, signal) in signals.iter().enumerate() {
            table.insert_callback(
                &format!("req_{i}"),
                CallbackKind::Hook,
                tokio::spawn(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }),
                signal.clone(),
                None,
            );
        }

        assert_eq!(table.abort_all_callbacks(), 3);
        assert_eq!(table.callbacks_len(), 0);
        for signal in signals {
            assert!(signal.is_aborted());
        }
    }
}
