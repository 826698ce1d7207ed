//! Outbound queue handles for client sockets.
//!
//! Every socket gets a bounded queue drained by its own writer task, so one
//! slow client never holds up delivery to the others: when a queue is full
//! the frame is dropped for that socket only.

use super::ConnectionId;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::sync::mpsc::error::TrySendError;
use axum::extract::ws::Message;
use tracing::{debug, trace};

/// Work item for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Write the message to the socket
    Frame(Message),
    /// Send a close frame with the given reason and stop writing
    Close(String),
}

/// Cloneable handle to one connection's writer queue.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    sender: mpsc::Sender<Outbound>,
    terminate: Arc<Notify>,
}

impl OutboundSender {
    /// Wraps the sending side of a writer queue.
    pub fn new(sender: mpsc::Sender<Outbound>) -> Self {
        Self { sender, terminate: Arc::new(Notify::new()) }
    }

    /// Creates a handle together with the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }

    /// Queues a text frame. Returns `false` if the frame was dropped.
    pub fn send_text(&self, text: &str) -> bool {
        self.enqueue(Outbound::Frame(Message::text(text.to_owned())))
    }

    /// Queues a heartbeat probe.
    pub fn ping(&self) -> bool {
        self.enqueue(Outbound::Frame(Message::Ping(Default::default())))
    }

    /// Asks the writer task to send a close frame and finish.
    ///
    /// Returns `false` if the queue had no room; callers that must end the
    /// connection then fall back to [`Self::terminate`].
    pub fn close(&self, reason: impl Into<String>) -> bool {
        self.enqueue(Outbound::Close(reason.into()))
    }

    /// Sends a close frame, or drops the socket if the close frame cannot
    /// be queued.
    pub fn close_or_terminate(&self, reason: impl Into<String>) {
        if !self.close(reason) {
            debug!("Close frame not queued, terminating socket");
            self.terminate();
        }
    }

    /// Asks the writer task to drop the socket without a close handshake.
    ///
    /// Bypasses the queue, so it works even when the queue is full.
    pub fn terminate(&self) {
        self.terminate.notify_one();
    }

    /// Resolves once [`Self::terminate`] has been called.
    pub async fn terminated(&self) {
        self.terminate.notified().await;
    }

    /// Whether the writer task has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn enqueue(&self, item: Outbound) -> bool {
        match self.sender.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Outbound queue closed, dropping frame");
                false
            }
        }
    }
}

/// Queues `text` on every given connection.
///
/// Returns the number of connections the frame was queued for.
pub fn deliver_to_all(targets: &[(ConnectionId, OutboundSender)], text: &str) -> usize {
    targets
        .iter()
        .filter(|(connection_id, outbound)| {
            let queued = outbound.send_text(text);
            if !queued {
                trace!(connection_id = %connection_id, "Skipped delivery");
            }
            queued
        })
        .count()
}
