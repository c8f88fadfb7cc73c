//! Receiving side of an actor address

use tokio::sync::mpsc;

/// Inbound queue of one actor
#[derive(Debug)]
pub struct Mailbox<M> {
    receiver: mpsc::UnboundedReceiver<M>,
    received: u64,
}

impl<M> Mailbox<M> {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self {
            receiver,
            received: 0,
        }
    }

    /// Wait for the next message; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<M> {
        let msg = self.receiver.recv().await;
        if msg.is_some() {
            self.received += 1;
        }
        msg
    }

    /// Take a message if one is already queued
    pub fn try_recv(&mut self) -> Option<M> {
        let msg = self.receiver.try_recv().ok();
        if msg.is_some() {
            self.received += 1;
        }
        msg
    }

    /// Number of messages taken from this mailbox so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Stop accepting new messages; already queued ones can still be read
    pub fn close(&mut self) {
        self.receiver.close();
    }
}
