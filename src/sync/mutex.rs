//! Async mutex with FIFO ownership transfer.
//!
//! Unlike a guard tied to a stack frame, the lock is represented by a
//! movable [`Ownership`] value: your code holds the mutex while it holds
//! the ownership, across awaits and across threads.
//!
//! ```ignore
//! let own = mutex.lock().await?;
//! do_async_work().await;
//! drop(own); // or own.release() to schedule the successor yourself
//! ```
//!
//! # Algorithm
//!
//! The holder/waiter census lives in one atomic counter: `0` is free,
//! `1` is held with no queued waiters, `n > 1` is held plus `n - 1`
//! queued. Contended lockers push their result channel onto a lock-free
//! queue *before* incrementing the counter; an incrementer that finds the
//! counter at zero has caught the lock between releases and hands
//! ownership to the queue head (which may be an earlier waiter, so FIFO
//! is preserved). Release decrements; if waiters remain it pops the head and
//! resumes it as the new holder. Only the release/grant path ever pops,
//! so a single party walks the served queue at a time.
//!
//! Guarantees: FIFO among waiters, starvation-free, and the uncontended
//! release never touches the queue.

use crate::handle::Handle;
use crate::prepared::PreparedTask;
use crate::task::Task;
use crate::Result;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Error returned when [`Mutex::try_lock`] cannot acquire immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryLockError {
    /// The mutex is currently held.
    #[error("mutex is locked")]
    Locked,
}

struct MutexInner {
    /// 0 = free, 1 = held with no waiters, n > 1 = held + n-1 queued.
    count: AtomicUsize,
    waiters: SegQueue<crate::ResultChannel<Ownership>>,
}

impl MutexInner {
    /// Hands the lock to the head waiter.
    ///
    /// The caller has already accounted for the hand-off in `count`. The
    /// queue cannot stay empty here: every counted waiter pushes its
    /// channel before incrementing, so at worst we spin for a push that
    /// is already in flight.
    fn grant_next(self: &Arc<Self>) -> PreparedTask {
        loop {
            if let Some(channel) = self.waiters.pop() {
                return channel.set(Ownership {
                    inner: Some(Arc::clone(self)),
                });
            }
            std::hint::spin_loop();
        }
    }

    fn unlock(self: &Arc<Self>) -> PreparedTask {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            return PreparedTask::empty();
        }
        self.grant_next()
    }
}

/// An async mutex. Cloning yields another handle to the same lock.
#[derive(Clone, Default)]
pub struct Mutex {
    inner: Arc<MutexInner>,
}

impl Default for MutexInner {
    fn default() -> Self {
        Self {
            count: AtomicUsize::new(0),
            waiters: SegQueue::new(),
        }
    }
}

impl Mutex {
    /// Creates an unlocked mutex.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the mutex without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TryLockError::Locked`] when the mutex is held.
    pub fn try_lock(&self) -> std::result::Result<Ownership, TryLockError> {
        if self
            .inner
            .count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Ok(Ownership {
                inner: Some(Arc::clone(&self.inner)),
            })
        } else {
            Err(TryLockError::Locked)
        }
    }

    /// Acquires the mutex, queueing if it is held.
    ///
    /// The fast path resolves synchronously. On contention the returned
    /// handle arms a producer that enqueues this locker; ownership
    /// arrives when predecessors release. Dropping the handle un-awaited
    /// still queues detached: the lock is acquired and immediately
    /// released when its turn comes.
    pub fn lock(&self) -> Handle<Ownership> {
        match self.try_lock() {
            Ok(own) => Handle::ready(own),
            Err(TryLockError::Locked) => {
                let inner = Arc::clone(&self.inner);
                Handle::deferred_fn(move |channel| {
                    tracing::trace!("mutex contended; queueing waiter");
                    inner.waiters.push(channel);
                    if inner.count.fetch_add(1, Ordering::AcqRel) == 0 {
                        // The holder released before we were counted; the
                        // queue head (not necessarily us) takes the lock.
                        return inner.grant_next();
                    }
                    PreparedTask::empty()
                })
            }
        }
    }

    /// Returns true if the mutex is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.count.load(Ordering::Acquire) > 0
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("count", &self.inner.count.load(Ordering::Relaxed))
            .finish()
    }
}

/// Ownership of a locked [`Mutex`]. Move-only; dropping it releases the
/// lock and resumes the next waiter.
#[must_use = "dropping ownership releases the mutex"]
pub struct Ownership {
    inner: Option<Arc<MutexInner>>,
}

impl Ownership {
    /// Releases the lock now.
    ///
    /// Returns the successor's resumption so the caller can schedule it
    /// after dropping its own locks; dropping the returned task resumes
    /// the successor immediately.
    pub fn release(mut self) -> PreparedTask {
        match self.inner.take() {
            Some(inner) => inner.unlock(),
            None => PreparedTask::empty(),
        }
    }
}

impl Drop for Ownership {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.unlock().resume();
        }
    }
}

impl std::fmt::Debug for Ownership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ownership").finish_non_exhaustive()
    }
}

/// Acquires a whole set of mutexes without deadlocking.
///
/// Tries every lock; on any failure it releases everything acquired and
/// asynchronously waits for the one that failed before retrying from it.
/// This is bounded-retry avoidance, not a global ordering: it is correct
/// when every contender for the same set goes through `MultiLock`.
#[derive(Clone, Debug)]
pub struct MultiLock {
    set: Vec<Mutex>,
}

impl MultiLock {
    /// Builds a multi-lock over the given mutexes.
    ///
    /// # Panics
    ///
    /// Panics if the set is empty.
    #[must_use]
    pub fn new(set: Vec<Mutex>) -> Self {
        assert!(!set.is_empty(), "multi-lock over an empty set");
        Self { set }
    }

    /// Acquires every mutex in the set.
    ///
    /// The resolved ownerships are in set order.
    pub fn lock(&self) -> Handle<Vec<Ownership>> {
        let set = self.set.clone();
        Handle::deferred(Task::new(Self::lock_set(set)))
    }

    async fn lock_set(set: Vec<Mutex>) -> Result<Vec<Ownership>> {
        let n = set.len();
        let mut owned: Vec<Option<Ownership>> = (0..n).map(|_| None).collect();
        let mut first = 0usize;
        loop {
            owned[first] = Some(set[first].lock().await?);
            let mut failed = None;
            for step in 1..n {
                let idx = (first + step) % n;
                match set[idx].try_lock() {
                    Ok(own) => owned[idx] = Some(own),
                    Err(TryLockError::Locked) => {
                        for slot in &mut owned {
                            slot.take();
                        }
                        failed = Some(idx);
                        break;
                    }
                }
            }
            match failed {
                None => {
                    return Ok(owned
                        .into_iter()
                        .map(|own| own.expect("every slot acquired"))
                        .collect());
                }
                Some(idx) => first = idx,
            }
        }
    }
}
