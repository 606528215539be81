//! Join N handles; resolves when all have fired.
//!
//! ```ignore
//! let mut a = fetch_first();   // Handle<u32>
//! let mut b = fetch_second();  // Handle<u32>
//! let all = WaitAll::new();
//! all.add(&mut a).resume();
//! all.add(&mut b).resume();
//! all.join().await?;
//! let first = a.try_value()?;
//! let second = b.try_value()?;
//! ```
//!
//! The waiter holds a counter primed at one: each added pending handle
//! increments it, each completion decrements, and the consumer published
//! by [`WaitAll::join`] performs the final decrement. Whoever brings the
//! counter to zero resumes the consumer, so the join is safe against
//! completions racing the await.

use crate::handle::{Handle, ResultChannel};
use crate::prepared::PreparedTask;
use crate::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Wake, Waker};

struct AllInner {
    remaining: AtomicUsize,
    consumer: Mutex<Option<ResultChannel<()>>>,
}

impl AllInner {
    fn complete(&self) {
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "join counter underflow; reset() missing");
        if previous == 1 {
            let consumer = self
                .consumer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(channel) = consumer {
                channel.set(()).resume();
            }
        }
    }
}

struct AllSlot {
    inner: Arc<AllInner>,
}

impl Wake for AllSlot {
    fn wake(self: Arc<Self>) {
        self.inner.complete();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.inner.complete();
    }
}

/// Waits until every added handle has resolved.
///
/// Reusable: after the join resolves, [`WaitAll::reset`] re-arms it for
/// another round.
#[derive(Clone)]
pub struct WaitAll {
    inner: Arc<AllInner>,
}

impl Default for WaitAll {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitAll {
    /// Creates an empty waiter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AllInner {
                remaining: AtomicUsize::new(1),
                consumer: Mutex::new(None),
            }),
        }
    }

    /// Registers a handle with the waiter.
    ///
    /// An already-ready handle is not counted. The handle must be kept
    /// alive by the caller until it resolves; its value stays retrievable
    /// through [`Handle::try_value`] after the join fires.
    pub fn add<T>(&self, handle: &mut Handle<T>) -> PreparedTask {
        if handle.is_ready() {
            return PreparedTask::empty();
        }
        self.inner.remaining.fetch_add(1, Ordering::AcqRel);
        let slot = Arc::new(AllSlot {
            inner: Arc::clone(&self.inner),
        });
        handle.attach_consumer(Waker::from(slot))
    }

    /// Starts the join: the returned handle resolves when every added
    /// handle has fired.
    #[must_use]
    pub fn join(&self) -> Handle<()> {
        let inner = Arc::clone(&self.inner);
        Handle::deferred_fn(move |channel| {
            {
                let mut consumer = inner
                    .consumer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                assert!(consumer.is_none(), "join already awaited");
                *consumer = Some(channel);
            }
            // The final decrement: pairs with the counter primed at one.
            inner.complete();
            PreparedTask::empty()
        })
    }

    /// Joins synchronously, blocking the calling thread.
    pub fn wait(&self) -> Result<()> {
        self.join().wait()
    }

    /// Re-arms a resolved waiter for another round.
    ///
    /// Returns false if completions are still outstanding.
    pub fn reset(&self) -> bool {
        self.inner
            .remaining
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for WaitAll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitAll")
            .field("remaining", &self.inner.remaining.load(Ordering::Relaxed))
            .finish()
    }
}
