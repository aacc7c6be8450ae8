//! Bounded, lossy event queues between background tasks and consumers.
//!
//! Every queue has a small fixed capacity and publishers never wait for
//! room: when a queue is full the event is dropped. Delivery is therefore
//! best-effort. Consumers that care about the current state should treat
//! events as hints and re-query the owning component (`get_status`,
//! `get_logs`) rather than rebuilding state from the event stream.
//!
//! A queue closes once every publisher for it is dropped, so a consumer
//! looping on `recv()` always terminates.

use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of every status/error queue.
pub const EVENT_QUEUE_CAPACITY: usize = 10;

/// Publishing half of a bounded lossy queue.
#[derive(Debug)]
pub struct EventPublisher<T> {
    tx: mpsc::Sender<T>,
    queue: &'static str,
}

impl<T> Clone for EventPublisher<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            queue: self.queue,
        }
    }
}

/// Create a bounded queue of [`EVENT_QUEUE_CAPACITY`] named `queue` (used in logs).
pub fn channel<T>(queue: &'static str) -> (EventPublisher<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    (EventPublisher { tx, queue }, rx)
}

impl<T> EventPublisher<T> {
    /// Publish without blocking. Returns `false` if the event was dropped
    /// because the queue is full or the consumer is gone.
    pub fn publish(&self, event: T) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(queue = self.queue, "Event queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Whether the consumer has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
