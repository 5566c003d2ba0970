//! Bounded delivery queues with explicit overflow policy
//!
//! The session's receive path must never block on a slow consumer and must
//! never grow without bound. Delivery therefore goes through a bounded
//! queue whose capacity and overflow policy are first-class configuration:
//! `DropOldest` displaces the stalest buffered item to make room for the
//! newest, `DropNewest` rejects the incoming item instead. `push` never
//! blocks; `recv` is async.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// What to do when a bounded queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the oldest buffered item to admit the new one
    DropOldest,
    /// Reject the new item and keep the buffer as-is
    DropNewest,
}

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

/// Producer half of a bounded queue
///
/// Single-writer by construction: the half is not cloneable, and dropping
/// it closes the queue so the consumer observes end-of-stream.
pub struct BoundedSender<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer half of a bounded queue
pub struct BoundedReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a bounded queue with the given capacity and overflow policy
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn bounded<T>(capacity: usize, policy: OverflowPolicy) -> (BoundedSender<T>, BoundedReceiver<T>) {
    assert!(capacity > 0, "bounded queue capacity must be non-zero");
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            queue: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        notify: Notify::new(),
        capacity,
        policy,
    });
    (
        BoundedSender {
            shared: Arc::clone(&shared),
        },
        BoundedReceiver { shared },
    )
}

impl<T> BoundedSender<T> {
    /// Enqueue an item without blocking
    ///
    /// Returns the item displaced by the overflow policy, if any: the
    /// oldest buffered item under `DropOldest`, the rejected input under
    /// `DropNewest`, or the input itself when the queue is closed.
    pub fn push(&self, item: T) -> Option<T> {
        let mut inner = match self.shared.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.closed {
            return Some(item);
        }

        let displaced = if inner.queue.len() >= self.shared.capacity {
            match self.shared.policy {
                OverflowPolicy::DropOldest => inner.queue.pop_front(),
                OverflowPolicy::DropNewest => {
                    return Some(item);
                }
            }
        } else {
            None
        };

        inner.queue.push_back(item);
        drop(inner);
        self.shared.notify.notify_one();
        displaced
    }

    /// Close the queue; the consumer drains remaining items then sees `None`
    pub fn close(&self) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.closed = true;
        }
        self.shared.notify.notify_waiters();
    }

    /// Number of items currently buffered
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared
            .inner
            .lock()
            .map(|inner| inner.queue.len())
            .unwrap_or(0)
    }

    /// Whether the buffer is currently empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for BoundedSender<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> BoundedReceiver<T> {
    /// Receive the next item, waiting if the queue is empty
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut inner = match self.shared.inner.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(item) = inner.queue.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Receive without waiting; `None` means empty or closed-and-drained
    pub fn try_recv(&mut self) -> Option<T> {
        self.shared
            .inner
            .lock()
            .ok()
            .and_then(|mut inner| inner.queue.pop_front())
    }

    /// Number of items currently buffered
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared
            .inner
            .lock()
            .map(|inner| inner.queue.len())
            .unwrap_or(0)
    }

    /// Whether the buffer is currently empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
