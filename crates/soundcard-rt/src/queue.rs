//! Bounded lock-free queues carrying position and device notifications off
//! the audio thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is empty")]
    Empty,
}

/// Shared between the producing audio thread and any number of readers.
///
/// The audio side never waits: a full queue rejects the event and the
/// rejection is counted instead.
#[derive(Debug)]
pub struct EventQueue<T> {
    queue: Arc<ArrayQueue<T>>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn try_push(&self, value: T) -> Result<(), QueueError> {
        self.queue.push(value).map_err(|_| QueueError::Full)
    }

    /// Pushes `value`, discarding it and bumping [`dropped`](Self::dropped) when full.
    pub fn publish(&self, value: T) -> bool {
        if self.queue.push(value).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn try_pop(&self) -> Result<T, QueueError> {
        self.queue.pop().ok_or(QueueError::Empty)
    }

    /// Pops everything currently queued.
    pub fn drain(&self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.queue.pop())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Events rejected by [`publish`](Self::publish) so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
