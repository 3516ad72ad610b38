//! Inbound queue between the broker session task and the application tick
//!
//! The session task holds an [`InboundSender`] and only ever enqueues. The
//! application owns the single [`InboundReceiver`] and drains it once per tick.
//! A drain takes a snapshot of the queue length first, so messages arriving while
//! a drain runs wait for the next tick.

use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;

/// Raw payload as delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    /// Payload as text; invalid UTF-8 sequences are replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = self.text();
        let preview: String = text.chars().take(32).collect();
        write!(
            f,
            "{} {} - {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            preview
        )
    }
}

/// Items produced by a session task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(InboundMessage),
    /// The broker session with this id ended without a local disconnect
    SessionClosed { session: u64 },
}

#[derive(Debug, Clone)]
pub struct InboundSender {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl InboundSender {
    /// Never blocks; drops the item with a warning if the receiver is gone
    pub fn push(&self, item: Inbound) {
        if let Err(e) = self.tx.send(item) {
            warn!("Inbound queue closed, dropping {:?}", e.0);
        }
    }
}

#[derive(Debug)]
pub struct InboundReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl InboundReceiver {
    /// Removes everything queued at call time, in arrival order
    pub fn drain(&mut self) -> Vec<Inbound> {
        let available = self.rx.len();
        let mut drained = Vec::with_capacity(available);
        for _ in 0..available {
            match self.rx.try_recv() {
                Ok(item) => drained.push(item),
                Err(_) => break,
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn inbound_queue() -> (InboundSender, InboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (InboundSender { tx }, InboundReceiver { rx })
}
