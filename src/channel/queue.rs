//! Bounded FIFO queue with async push/pop and backpressure.
//!
//! A [`BoundedQueue`] holds up to `capacity` buffered items plus two
//! waiter lines under one lock: producers blocked on a full buffer and
//! consumers blocked on an empty one. Hand-off is direct where possible:
//! a push meeting a waiting popper bypasses the buffer, and a pop
//! meeting a waiting pusher refills the buffer behind itself, which
//! keeps FIFO order across both sides.
//!
//! ```ignore
//! let queue = BoundedQueue::new(16);
//! queue.push(item).await?;          // suspends only when full
//! let item = queue.pop().await?;    // suspends only when empty
//! ```
//!
//! A push handle completes synchronously when it can deliver without
//! blocking; one that is dropped unobserved keeps its producer running
//! detached, so the item is still delivered once room appears.
//!
//! Closing the queue stores an error that wakes all waiting poppers and
//! fails later pops once the buffer drains; pushes still succeed while
//! there is room.

use crate::handle::{Handle, ResultChannel};
use crate::prepared::{PreparedList, PreparedTask};
use crate::{Error, ErrorKind};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct PushWaiter<T> {
    item: T,
    channel: ResultChannel<()>,
}

struct QueueState<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    push_waiters: VecDeque<PushWaiter<T>>,
    pop_waiters: VecDeque<ResultChannel<T>>,
    closed: Option<Error>,
}

impl<T> QueueState<T> {
    /// Takes the head item and refills the freed slot from a waiting
    /// pusher. Returns the pusher's resumption, if any.
    fn take_head(&mut self, ready: &mut PreparedList) -> Option<T> {
        let item = self.buffer.pop_front()?;
        if let Some(waiter) = self.push_waiters.pop_front() {
            self.buffer.push_back(waiter.item);
            ready.push(waiter.channel.set(()));
        }
        Some(item)
    }

    fn closed_error(&self) -> Error {
        self.closed.clone().unwrap_or_else(|| {
            Error::new(ErrorKind::QueueClosed)
        })
    }
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
}

impl<T> QueueInner<T> {
    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A bounded multi-producer multi-consumer FIFO queue.
///
/// Cloning yields another handle to the same queue.
pub struct BoundedQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> BoundedQueue<T> {
    /// Creates a queue holding up to `capacity` buffered items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be at least 1");
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    buffer: VecDeque::with_capacity(capacity),
                    capacity,
                    push_waiters: VecDeque::new(),
                    pop_waiters: VecDeque::new(),
                    closed: None,
                }),
            }),
        }
    }

    /// Pushes an item, waiting for room if the buffer is full.
    ///
    /// Resolves once the item has been handed to a popper or buffered.
    /// If the handle is dropped without being observed, the item is
    /// still delivered when room appears (the producer runs detached).
    pub fn push(&self, item: T) -> Handle<()> {
        let mut ready = PreparedList::new();
        {
            let mut state = self.inner.state();
            if let Some(popper) = state.pop_waiters.pop_front() {
                debug_assert!(state.buffer.is_empty());
                drop(state);
                ready.push(popper.set(item));
                drop(ready);
                return Handle::ready(());
            }
            if state.buffer.len() < state.capacity {
                state.buffer.push_back(item);
                return Handle::ready(());
            }
        }
        tracing::trace!("queue full; producer will wait");
        let inner = Arc::clone(&self.inner);
        Handle::deferred_fn(move |channel| {
            let mut ready = PreparedList::new();
            let mut state = inner.state();
            // Room may have appeared between the call and the arm.
            if let Some(popper) = state.pop_waiters.pop_front() {
                drop(state);
                ready.push(popper.set(item));
                ready.push(channel.set(()));
            } else if state.buffer.len() < state.capacity {
                state.buffer.push_back(item);
                drop(state);
                ready.push(channel.set(()));
            } else {
                state.push_waiters.push_back(PushWaiter { item, channel });
            }
            drop(ready);
            PreparedTask::empty()
        })
    }

    /// Pops the next item, waiting if the queue is empty.
    ///
    /// Once the queue is closed and drained, resolves with the stored
    /// close error.
    pub fn pop(&self) -> Handle<T> {
        let mut ready = PreparedList::new();
        {
            let mut state = self.inner.state();
            if let Some(item) = state.take_head(&mut ready) {
                drop(state);
                drop(ready);
                return Handle::ready(item);
            }
            if state.closed.is_some() {
                return Handle::error(state.closed_error());
            }
        }
        let inner = Arc::clone(&self.inner);
        Handle::deferred_fn(move |channel| {
            let mut ready = PreparedList::new();
            let mut state = inner.state();
            // An item may have arrived between the call and the arm.
            if let Some(item) = state.take_head(&mut ready) {
                drop(state);
                ready.push(channel.set(item));
            } else if state.closed.is_some() {
                let error = state.closed_error();
                drop(state);
                ready.push(channel.set_error(error));
            } else {
                state.pop_waiters.push_back(channel);
            }
            drop(ready);
            PreparedTask::empty()
        })
    }

    /// Closes the queue with an error.
    ///
    /// All currently waiting poppers resume with a copy of the error;
    /// later pops fail with it once the buffer is drained. Pushes keep
    /// succeeding while there is room.
    pub fn close(&self, error: Error) {
        let mut ready = PreparedList::new();
        {
            let mut state = self.inner.state();
            tracing::debug!(waiting_poppers = state.pop_waiters.len(), "closing queue");
            state.closed = Some(error.clone());
            while let Some(popper) = state.pop_waiters.pop_front() {
                ready.push(popper.set_error(error.clone()));
            }
        }
        drop(ready);
    }

    /// Returns true once the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state().closed.is_some()
    }

    /// Drains all buffered items, discarding them and resuming stuck
    /// producers.
    pub fn clear(&self) {
        let mut ready = PreparedList::new();
        {
            let mut state = self.inner.state();
            while state.take_head(&mut ready).is_some() {}
        }
        drop(ready);
    }

    /// Number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state().buffer.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state().buffer.is_empty()
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pop_through_the_buffer() {
        let queue = BoundedQueue::new(2);
        queue.push(1).wait().expect("push");
        queue.push(2).wait().expect("push");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().wait().expect("pop"), 1);
        assert_eq!(queue.pop().wait().expect("pop"), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn push_suspends_when_full() {
        let queue = BoundedQueue::new(1);
        queue.push(1).wait().expect("push");

        let mut blocked = queue.push(2);
        blocked
            .attach_consumer(PreparedTask::empty().into_waker())
            .resume();
        assert!(!blocked.is_ready());

        assert_eq!(queue.pop().wait().expect("pop"), 1);
        assert!(blocked.is_ready());
        blocked.try_value().expect("push completed");
        assert_eq!(queue.pop().wait().expect("pop"), 2);
    }

    #[test]
    fn pop_suspends_when_empty() {
        let queue = BoundedQueue::new(1);
        let queue2 = queue.clone();

        let popper = std::thread::spawn(move || queue2.pop().wait().expect("pop"));
        std::thread::sleep(std::time::Duration::from_millis(10));
        queue.push(9).wait().expect("push");
        assert_eq!(popper.join().expect("popper"), 9);
    }

    #[test]
    fn direct_hand_off_preserves_order() {
        let queue = BoundedQueue::new(1);
        let queue2 = queue.clone();

        let popper = std::thread::spawn(move || {
            let first = queue2.pop().wait().expect("pop");
            let second = queue2.pop().wait().expect("pop");
            (first, second)
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        queue.push(1).wait().expect("push");
        queue.push(2).wait().expect("push");
        assert_eq!(popper.join().expect("popper"), (1, 2));
    }

    #[test]
    fn unobserved_push_still_delivers() {
        let queue = BoundedQueue::new(1);
        drop(queue.push(1)); // room available: lands in the buffer at once
        assert_eq!(queue.len(), 1);

        // A full queue parks the detached producer instead; the item
        // arrives once room appears.
        drop(queue.push(2));
        assert_eq!(queue.pop().wait().expect("pop"), 1);
        assert_eq!(queue.pop().wait().expect("pop"), 2);
    }

    #[test]
    fn close_wakes_waiting_poppers() {
        let queue: BoundedQueue<i32> = BoundedQueue::new(1);
        let queue2 = queue.clone();

        let popper = std::thread::spawn(move || queue2.pop().wait());
        std::thread::sleep(std::time::Duration::from_millis(10));
        queue.close(Error::new(ErrorKind::QueueClosed).with_context("shutting down"));

        let err = popper.join().expect("popper").expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::QueueClosed);
    }

    #[test]
    fn closed_queue_drains_before_failing() {
        let queue = BoundedQueue::new(2);
        queue.push(5).wait().expect("push");
        queue.close(Error::new(ErrorKind::QueueClosed));

        assert_eq!(queue.pop().wait().expect("buffered item"), 5);
        let err = queue.pop().wait().expect_err("drained");
        assert_eq!(err.kind(), ErrorKind::QueueClosed);
    }

    #[test]
    fn pushes_succeed_while_closed_but_not_full() {
        let queue = BoundedQueue::new(2);
        queue.close(Error::new(ErrorKind::QueueClosed));
        queue.push(1).wait().expect("push after close");
        assert_eq!(queue.pop().wait().expect("pop"), 1);
    }

    #[test]
    fn clear_discards_items_and_unblocks_producers() {
        let queue = BoundedQueue::new(1);
        queue.push(1).wait().expect("push");

        let mut blocked = queue.push(2);
        blocked
            .attach_consumer(PreparedTask::empty().into_waker())
            .resume();
        assert!(!blocked.is_ready());

        queue.clear();
        assert!(queue.is_empty());
        assert!(blocked.is_ready());
        blocked.try_value().expect("producer resumed");
    }

    #[test]
    fn fifo_across_many_producers() {
        let queue = BoundedQueue::new(4);
        for i in 0..4 {
            queue.push(i).wait().expect("push");
        }
        for i in 0..4 {
            assert_eq!(queue.pop().wait().expect("pop"), i);
        }
    }
}
