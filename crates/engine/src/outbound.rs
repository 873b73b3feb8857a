//! Bounded outbound notification queue.
//!
//! Sends never block: overflow drops the message, logs it, and bumps the
//! drop counter so the loss is observable.

use std::sync::Arc;

use tokio::sync::mpsc;

use sb_domain::message::OutboundMessage;

use crate::metrics::Counters;

#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<OutboundMessage>,
    counters: Arc<Counters>,
}

impl OutboundQueue {
    pub fn new(capacity: usize, counters: Arc<Counters>) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, counters }, rx)
    }

    /// Non-blocking send. A full queue drops the message.
    pub fn send(&self, msg: OutboundMessage) {
        if let Err(e) = self.tx.try_send(msg) {
            let dropped = match &e {
                mpsc::error::TrySendError::Full(m) | mpsc::error::TrySendError::Closed(m) => m,
            };
            tracing::warn!(
                channel = %dropped.channel,
                chat_id = %dropped.chat_id,
                "outbound queue full, dropping message"
            );
            self.counters.outbound_drop();
        }
    }
}
