// src/messaging/queue.rs
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::rabbitmq::errors::{RabbitMQError, Result};

/// Unbounded FIFO of raw message bodies shared between a worker and the rest
/// of the process.
///
/// Cloning is cheap and every clone refers to the same queue. The queue is
/// created once and lives as long as any handle to it; reconnects never reset
/// it, so whatever was queued during a broker outage is still there afterwards.
#[derive(Clone, Default)]
pub struct MessageQueue {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    items: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        // A panicking holder cannot leave the deque half-updated.
        self.inner.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message at the back of the queue.
    pub fn push(&self, message: impl Into<Vec<u8>>) -> Result<()> {
        self.insert(message.into(), false)
    }

    /// Put a message back at the head of the queue, ahead of anything queued since.
    pub fn push_front(&self, message: impl Into<Vec<u8>>) -> Result<()> {
        self.insert(message.into(), true)
    }

    fn insert(&self, message: Vec<u8>, front: bool) -> Result<()> {
        if self.is_closed() {
            return Err(RabbitMQError::QueueClosed);
        }
        {
            let mut items = self.items();
            if front {
                items.push_front(message);
            } else {
                items.push_back(message);
            }
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<Vec<u8>> {
        self.items().pop_front()
    }

    /// Wait up to `timeout` for a message. Returns `None` when the wait elapses
    /// with the queue still empty.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_pop() {
                return Some(message);
            }
            // notify_one keeps a permit when nobody is waiting, so a push that
            // lands between try_pop and here still wakes us.
            if tokio::time::timeout_at(deadline, self.inner.notify.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Refuse further pushes. Messages already queued can still be popped.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Drain everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.items().drain(..).collect()
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
