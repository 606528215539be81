//! A resumable unit of work, not yet resumed.
//!
//! [`PreparedTask`] decouples *deciding who runs next* from *actually
//! running them*. Internal locks are released before the contained
//! continuation fires: an operation performed under a lock returns a
//! `PreparedTask`, and the caller resumes it (or simply drops it) after
//! the lock is gone.
//!
//! Dropping a `PreparedTask` resumes it. Use [`PreparedTask::cancel`] to
//! discard one without running it.

use smallvec::SmallVec;
use std::sync::{Arc, OnceLock};
use std::task::{Wake, Waker};

/// A small buffer of prepared tasks, collected under a lock and resumed
/// after it is released. Dropping the buffer resumes every entry.
pub type PreparedList = SmallVec<[PreparedTask; 4]>;

/// A suspended continuation, resumed on drop.
///
/// Holds either nothing or one wake handle. Move-only, no copy.
#[derive(Debug)]
#[must_use = "dropping resumes the task immediately; hold it to defer resumption"]
pub struct PreparedTask {
    waker: Option<Waker>,
}

impl PreparedTask {
    /// Creates an empty prepared task. Resuming it is a no-op.
    #[must_use]
    pub const fn empty() -> Self {
        Self { waker: None }
    }

    /// Wraps a wake handle into a prepared task.
    #[must_use]
    pub const fn from_waker(waker: Waker) -> Self {
        Self { waker: Some(waker) }
    }

    /// Returns true if there is nothing to resume.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.waker.is_none()
    }

    /// Resumes the contained continuation now.
    pub fn resume(mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    /// Discards the continuation without resuming it.
    ///
    /// The party waiting on the resumption will never run; only use this
    /// when that party is known to be torn down.
    pub fn cancel(mut self) {
        self.waker = None;
    }

    /// Releases the wake handle for hand-off to a host executor.
    ///
    /// Never null: an empty prepared task yields a no-op waker. This is
    /// the tail-call analog: instead of resuming here, the caller lets
    /// its own executor continue with the returned waker.
    #[must_use]
    pub fn into_waker(mut self) -> Waker {
        self.waker.take().unwrap_or_else(noop_waker)
    }
}

impl Drop for PreparedTask {
    fn drop(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

impl From<Waker> for PreparedTask {
    fn from(waker: Waker) -> Self {
        Self::from_waker(waker)
    }
}

impl From<Option<Waker>> for PreparedTask {
    fn from(waker: Option<Waker>) -> Self {
        Self { waker }
    }
}

struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
    fn wake_by_ref(self: &Arc<Self>) {}
}

fn noop_waker() -> Waker {
    static NOOP: OnceLock<Waker> = OnceLock::new();
    NOOP.get_or_init(|| Waker::from(Arc::new(NoopWake))).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWake(Arc<AtomicUsize>);

    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Waker, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let waker = Waker::from(Arc::new(CountingWake(Arc::clone(&hits))));
        (waker, hits)
    }

    #[test]
    fn empty_is_inert() {
        let task = PreparedTask::empty();
        assert!(task.is_empty());
        task.resume();
    }

    #[test]
    fn resume_wakes_once() {
        let (waker, hits) = counting();
        let task = PreparedTask::from_waker(waker);
        assert!(!task.is_empty());
        task.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_resumes() {
        let (waker, hits) = counting();
        drop(PreparedTask::from_waker(waker));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_suppresses_resumption() {
        let (waker, hits) = counting();
        PreparedTask::from_waker(waker).cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn into_waker_defers_to_caller() {
        let (waker, hits) = counting();
        let released = PreparedTask::from_waker(waker).into_waker();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        released.wake();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_into_waker_is_noop() {
        let waker = PreparedTask::empty().into_waker();
        waker.wake();
    }
}
