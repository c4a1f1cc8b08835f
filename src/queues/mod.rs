//! Bounded mailboxes between the core and the transport.
//!
//! Every queue is non-blocking on the sending side: a full queue is an
//! error the caller handles, never a stall. Repeated full-queue errors
//! indicate a stuck consumer and should trip the node into `Error`.

pub mod client_errors;
pub mod resource;

use std::sync::Arc;

use futures::future::poll_fn;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{graph::Slot, RoundId};

/// The depth of the round descriptor queues.
pub const ROUND_QUEUE_DEPTH: usize = 1;

/// The depth of the completed-round queue.
pub const COMPLETED_QUEUE_DEPTH: usize = 100;

/// An error produced by a bounded queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity; the item was not enqueued.
    #[error("queue `{0}` is full")]
    Full(&'static str),
    /// The queue holds nothing to receive.
    #[error("queue `{0}` is empty")]
    Empty(&'static str),
    /// The queue's other side is gone.
    #[error("queue `{0}` is closed")]
    Closed(&'static str),
    /// The resource queue runner did not acknowledge a kill in time.
    #[error("queue `{0}` did not acknowledge the kill in time")]
    KillTimeout(&'static str),
}

/// One finished round as delivered to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRound {
    pub round_id: RoundId,
    pub slots: Vec<Slot>,
}

/// A bounded, non-blocking mailbox.
///
/// `try_send` and `try_recv` implement the fail-fast contract; `recv` is
/// the awaiting variant used by the consumer loops.
pub struct RoundQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for RoundQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> RoundQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name,
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueues without blocking; a full queue is the caller's problem.
    pub fn try_send(&self, item: T) -> Result<(), QueueError> {
        self.tx.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => QueueError::Full(self.name),
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed(self.name),
        })
    }

    /// Dequeues without blocking.
    pub fn try_recv(&self) -> Result<T, QueueError> {
        self.rx.lock().try_recv().map_err(|err| match err {
            mpsc::error::TryRecvError::Empty => QueueError::Empty(self.name),
            mpsc::error::TryRecvError::Disconnected => QueueError::Closed(self.name),
        })
    }

    /// Awaits the next item. Intended for the single consumer loop; the
    /// inner lock is only held across individual polls.
    pub async fn recv(&self) -> Option<T> {
        poll_fn(|cx| self.rx.lock().poll_recv(cx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_full_queue_rejects_the_overflowing_send() {
        let queue = RoundQueue::new("depth-two", 2);
        queue.try_send(1u32).unwrap();
        queue.try_send(2).unwrap();
        assert_eq!(queue.try_send(3), Err(QueueError::Full("depth-two")));

        // Draining reopens capacity.
        assert_eq!(queue.try_recv(), Ok(1));
        queue.try_send(3).unwrap();
    }

    #[tokio::test]
    async fn an_empty_queue_rejects_receives() {
        let queue: RoundQueue<u32> = RoundQueue::new("empty", 1);
        assert_eq!(queue.try_recv(), Err(QueueError::Empty("empty")));
    }

    #[tokio::test]
    async fn recv_wakes_on_send() {
        let queue = RoundQueue::new("wake", 1);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        queue.try_send(7u32).unwrap();
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[test]
    fn recv_is_pending_until_a_send() {
        use tokio_test::{assert_pending, assert_ready_eq, task};

        let queue = RoundQueue::new("pending", 1);
        let mut recv = task::spawn(queue.recv());
        assert_pending!(recv.poll());

        queue.try_send(3u32).unwrap();
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), Some(3));
    }
}
