//! Subscriber fan-out: pre-subscribe buffering and FIFO promotion
//!
//! A session has at most one *active* subscriber at a time; it receives
//! every SDK message plus the partial-streaming updates. Subscribers that
//! attach while a response is in progress wait in a FIFO queue and are
//! promoted when the current turn completes. Messages that arrive before
//! any subscriber exists land in a bounded pre-subscribe buffer which the
//! first subscriber drains in order.
//!
//! Delivery is gated until the initialize handshake completes: nothing
//! reaches a subscriber before the init reply is matched.

use std::collections::VecDeque;

use log::warn;
use tokio::sync::mpsc;

use crate::events::StreamUpdate;
use crate::types::SdkMessage;

/// One item delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A complete SDK message
    Message(SdkMessage),
    /// A partial-streaming update (active subscriber only)
    Update(StreamUpdate),
}

struct Subscriber {
    tx: mpsc::UnboundedSender<StreamItem>,
}

/// The fan-out state, owned by the Control Client.
pub struct SubscriberHub {
    buffer: VecDeque<SdkMessage>,
    buffer_cap: usize,
    dropped: u64,
    active: Option<Subscriber>,
    queue: VecDeque<Subscriber>,
    delivery_enabled: bool,
}

impl SubscriberHub {
    /// `buffer_cap` bounds the pre-subscribe buffer; the oldest entry is
    /// dropped (with a warning) when it fills.
    pub fn new(buffer_cap: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            buffer_cap,
            dropped: 0,
            active: None,
            queue: VecDeque::new(),
            delivery_enabled: false,
        }
    }

    /// Open the gate after the initialize reply is matched, draining the
    /// buffer into the active subscriber if one is already attached.
    pub fn enable_delivery(&mut self) {
        self.delivery_enabled = true;
        self.drain_buffer_to_active();
    }

    /// Attach a subscriber. The first becomes active (and drains the
    /// buffer); later ones queue FIFO until promoted.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StreamItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber { tx };
        if self.active.is_none() {
            self.active = Some(subscriber);
            self.drain_buffer_to_active();
        } else {
            self.queue.push_back(subscriber);
        }
        rx
    }

    /// Deliver a complete SDK message, or buffer it when no delivery is
    /// possible yet.
    pub fn deliver_message(&mut self, message: SdkMessage) {
        if self.delivery_enabled {
            if let Some(active) = &self.active {
                match active.tx.send(StreamItem::Message(message)) {
                    Ok(()) => return,
                    // Receiver dropped; the subscriber is gone. The send
                    // error hands the message back for buffering.
                    Err(mpsc::error::SendError(item)) => {
                        self.active = None;
                        if let StreamItem::Message(recovered) = item {
                            self.push_buffer(recovered);
                        }
                        return;
                    }
                }
            }
        }
        self.push_buffer(message);
    }

    /// Deliver a partial-streaming update to the active subscriber only.
    /// Updates are never buffered.
    pub fn deliver_update(&mut self, update: StreamUpdate) {
        if !self.delivery_enabled {
            return;
        }
        if let Some(active) = &self.active {
            if active.tx.send(StreamItem::Update(update)).is_err() {
                self.active = None;
            }
        }
    }

    /// Terminal completion: close the active subscriber's channel and
    /// promote the next queued one.
    pub fn finish_turn(&mut self) {
        self.active = self.queue.pop_front();
    }

    /// Session teardown. Every subscriber — active and queued — receives
    /// the terminal message (if any) before its channel closes.
    pub fn shutdown(&mut self, terminal: Option<SdkMessage>) {
        if let Some(message) = terminal {
            if let Some(active) = &self.active {
                let _ = active.tx.send(StreamItem::Message(message.clone()));
            }
            for subscriber in &self.queue {
                let _ = subscriber.tx.send(StreamItem::Message(message.clone()));
            }
        }
        self.active = None;
        self.queue.clear();
        self.buffer.clear();
    }

    /// Number of messages waiting in the pre-subscribe buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a subscriber is currently active.
    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    fn push_buffer(&mut self, message: SdkMessage) {
        if self.buffer.len() == self.buffer_cap {
            self.buffer.pop_front();
            self.dropped += 1;
            warn!(
                "pre-subscribe buffer full ({} entries); dropped oldest ({} total)",
                self.buffer_cap, self.dropped
            );
        }
        self.buffer.push_back(message);
    }

    fn drain_buffer_to_active(&mut self) {
        if !self.delivery_enabled {
            return;
        }
        let Some(active) = &self.active else {
            return;
        };
        while let Some(message) = self.buffer.pop_front() {
            if let Err(mpsc::error::SendError(item)) =
                active.tx.send(StreamItem::Message(message))
            {
                if let StreamItem::Message(recovered) = item {
                    self.buffer.push_front(recovered);
                }
                self.active = None;
                return;
            }
        }
    }
}

impl std::fmt::Debug for SubscriberHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHub")
            .field("buffered", &self.buffer.len())
            .field("active", &self.active.is_some())
            .field("queued", &self.queue.len())
            .field("delivery_enabled", &self.delivery_enabled)
            .finish()
    }
}
