//! Iterate completions as they arrive, returning the index of each.
//!
//! ```ignore
//! let each = &mut WaitEach::new(handles.len());
//! for h in &mut handles {
//!     each.add(h).resume();
//! }
//! while let Ok(index) = each.next().await {
//!     let value = handles[index].try_value()?;
//! }
//! ```
//!
//! Slots are numbered in registration order, but completions are
//! reported in the order they actually completed. A slot that was
//! already ready at registration counts as completed immediately.
//!
//! # Protocol
//!
//! Completions claim consecutive cells through an atomic write cursor
//! and stamp their slot index into the cell (offset so that 0 and 1 stay
//! reserved). The consumer reads cells in order; when it finds an empty
//! one it stakes a claim token instead and parks. Exactly one of the two
//! parties observes the other's token, so a completion racing the claim
//! is delivered exactly once.
//!
//! Individual handle errors are not routed here; they surface when the
//! user reads the indexed handle.

use crate::handle::{Handle, ResultChannel};
use crate::prepared::PreparedTask;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Wake, Waker};

/// Cell is untouched.
const IDLE: usize = 0;
/// Cell is claimed by the parked consumer.
const CLAIMED: usize = 1;
/// Completed slot indices are stored offset past the reserved tokens.
const FIRST_INDEX: usize = 2;

struct EachInner {
    cells: Box<[AtomicUsize]>,
    write_pos: AtomicUsize,
    consumer: Mutex<Option<ResultChannel<usize>>>,
}

impl EachInner {
    fn complete(&self, index: usize) {
        let cell = self.write_pos.fetch_add(1, Ordering::SeqCst);
        debug_assert!(cell < self.cells.len(), "more completions than slots");
        let previous = self.cells[cell].swap(index + FIRST_INDEX, Ordering::SeqCst);
        if previous == CLAIMED {
            let consumer = self
                .consumer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(channel) = consumer {
                channel.set(index).resume();
            }
        }
    }
}

struct EachSlot {
    inner: Arc<EachInner>,
    index: usize,
}

impl Wake for EachSlot {
    fn wake(self: Arc<Self>) {
        self.inner.complete(self.index);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.inner.complete(self.index);
    }
}

/// Reports which of N handles completed, one at a time, in completion
/// order.
///
/// Capacity is fixed at construction; slots are assigned by
/// [`WaitEach::add`] in call order. Single consumer: the handle returned
/// by [`WaitEach::next`] must resolve before `next` is called again.
pub struct WaitEach {
    inner: Arc<EachInner>,
    added: usize,
    next_cell: usize,
}

impl WaitEach {
    /// Creates a multiplexer for up to `capacity` handles.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cells = (0..capacity).map(|_| AtomicUsize::new(IDLE)).collect();
        Self {
            inner: Arc::new(EachInner {
                cells,
                write_pos: AtomicUsize::new(0),
                consumer: Mutex::new(None),
            }),
            added: 0,
            next_cell: 0,
        }
    }

    /// Registers a handle under the next slot index.
    ///
    /// A handle that is already ready completes its slot immediately.
    /// More handles can be added between waits, up to the capacity.
    ///
    /// # Panics
    ///
    /// Panics when adding beyond the construction capacity.
    pub fn add<T>(&mut self, handle: &mut Handle<T>) -> PreparedTask {
        assert!(
            self.added < self.inner.cells.len(),
            "wait set is full; construct it with a larger capacity"
        );
        let index = self.added;
        self.added += 1;
        if handle.is_ready() {
            self.inner.complete(index);
            return PreparedTask::empty();
        }
        let slot = Arc::new(EachSlot {
            inner: Arc::clone(&self.inner),
            index,
        });
        handle.attach_consumer(Waker::from(slot))
    }

    /// Number of registered slots not yet reported.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.added - self.next_cell
    }

    /// Returns true once every registered slot has been reported.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.pending() == 0
    }

    /// The next completed slot index.
    ///
    /// Resolves with the index of the next completion (queued completions
    /// are drained in order before the consumer parks). Once all
    /// registered slots have been reported the returned handle is Empty,
    /// so awaiting it yields `Canceled`, the stop condition.
    pub fn next(&mut self) -> Handle<usize> {
        if self.next_cell >= self.added {
            return Handle::empty();
        }
        let cell = self.next_cell;
        self.next_cell += 1;

        let current = self.inner.cells[cell].load(Ordering::SeqCst);
        if current >= FIRST_INDEX {
            return Handle::ready(current - FIRST_INDEX);
        }

        let inner = Arc::clone(&self.inner);
        Handle::deferred_fn(move |channel| {
            {
                let mut consumer = inner
                    .consumer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                assert!(consumer.is_none(), "previous wait is still pending");
                *consumer = Some(channel);
            }
            let previous = inner.cells[cell].swap(CLAIMED, Ordering::SeqCst);
            if previous >= FIRST_INDEX {
                // A completion landed between the scan and the claim.
                let consumer = inner
                    .consumer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(channel) = consumer {
                    return channel.set(previous - FIRST_INDEX);
                }
            }
            PreparedTask::empty()
        })
    }

    /// Blocks for the next completed slot index.
    pub fn wait_next(&mut self) -> crate::Result<usize> {
        self.next().wait()
    }
}

impl std::fmt::Debug for WaitEach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitEach")
            .field("capacity", &self.inner.cells.len())
            .field("added", &self.added)
            .field("reported", &self.next_cell)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn parked_set(n: usize) -> (Vec<Handle<usize>>, Arc<StdMutex<Vec<Option<ResultChannel<usize>>>>>) {
        let parked = Arc::new(StdMutex::new((0..n).map(|_| None).collect::<Vec<_>>()));
        let handles = (0..n)
            .map(|i| {
                let parked = Arc::clone(&parked);
                Handle::deferred_fn(move |channel| {
                    parked.lock().unwrap()[i] = Some(channel);
                    PreparedTask::empty()
                })
            })
            .collect();
        (handles, parked)
    }

    #[test]
    fn reports_completion_order_not_registration_order() {
        let (mut handles, parked) = parked_set(3);
        let mut each = WaitEach::new(3);
        for h in &mut handles {
            each.add(h).resume();
        }

        for index in [2usize, 0, 1] {
            let channel = parked.lock().unwrap()[index].take().expect("armed");
            channel.set(index * 10).resume();
        }

        assert_eq!(each.wait_next().expect("first"), 2);
        assert_eq!(each.wait_next().expect("second"), 0);
        assert_eq!(each.wait_next().expect("third"), 1);
        assert!(each.is_done());

        assert_eq!(handles[2].try_value().expect("slot 2"), 20);
    }

    #[test]
    fn ready_handles_complete_their_slot_at_registration() {
        let mut ready = Handle::ready(5usize);
        let (mut pending, parked) = parked_set(1);
        let mut each = WaitEach::new(2);
        each.add(&mut pending[0]).resume();
        each.add(&mut ready).resume();

        assert_eq!(each.wait_next().expect("ready slot first"), 1);
        parked.lock().unwrap()[0].take().expect("armed").set(0).resume();
        assert_eq!(each.wait_next().expect("pending slot"), 0);
    }

    #[test]
    fn consumer_parks_until_a_completion_arrives() {
        let (mut handles, parked) = parked_set(2);
        let mut each = WaitEach::new(2);
        for h in &mut handles {
            each.add(h).resume();
        }

        let resolver = {
            let parked = Arc::clone(&parked);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                let channel = parked.lock().unwrap()[1].take().expect("armed");
                channel.set(0).resume();
            })
        };

        assert_eq!(each.wait_next().expect("parked wait"), 1);
        resolver.join().expect("resolver");

        parked.lock().unwrap()[0].take().expect("armed").set(0).resume();
        assert_eq!(each.wait_next().expect("second"), 0);
    }

    #[test]
    fn exhausted_set_reports_canceled() {
        let mut ready = Handle::ready(1usize);
        let mut each = WaitEach::new(1);
        each.add(&mut ready).resume();
        assert_eq!(each.wait_next().expect("only slot"), 0);
        let err = each.wait_next().expect_err("no slots left");
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[test]
    fn child_errors_stay_in_the_child() {
        let (mut handles, parked) = parked_set(1);
        let mut each = WaitEach::new(1);
        each.add(&mut handles[0]).resume();

        let channel = parked.lock().unwrap()[0].take().expect("armed");
        channel.set_error(crate::Error::invalid_state()).resume();

        assert_eq!(each.wait_next().expect("index still reported"), 0);
        assert_eq!(
            handles[0].try_value().expect_err("child error").kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn slots_can_be_added_between_waits() {
        let (mut handles, parked) = parked_set(2);
        let mut each = WaitEach::new(2);
        each.add(&mut handles[0]).resume();

        parked.lock().unwrap()[0].take().expect("armed").set(0).resume();
        assert_eq!(each.wait_next().expect("first"), 0);

        each.add(&mut handles[1]).resume();
        parked.lock().unwrap()[1].take().expect("armed").set(0).resume();
        assert_eq!(each.wait_next().expect("second"), 1);
    }

    #[test]
    #[should_panic(expected = "wait set is full")]
    fn adding_past_capacity_panics() {
        let mut each = WaitEach::new(1);
        let mut a = Handle::ready(1);
        let mut b = Handle::ready(2);
        each.add(&mut a).resume();
        each.add(&mut b).resume();
    }
}
