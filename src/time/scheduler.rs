//! Timed wakeups driven by a single worker thread.
//!
//! The [`Scheduler`] owns a [`TimerHeap`] of sleeping result channels, a
//! condition variable, and a worker thread spawned at construction. The
//! worker peeks the earliest deadline, fires past-due entries (resolving
//! their channels outside the lock), and otherwise waits, either until
//! the next deadline or until a new registration becomes the minimum.
//!
//! ```ignore
//! let scheduler = Scheduler::new();
//! scheduler.sleep_for(Duration::from_millis(100)).await?;
//! ```
//!
//! # Alerts
//!
//! An alertable sleep is filed under its [`AlertFlag`]'s identity.
//! [`Scheduler::alert`] sets the flag and re-stamps that entry's
//! deadline to now, so the sleeper fires on the next worker pass. It
//! resolves normally (with a value, not `Canceled`); the woken party
//! checks the flag. A flag that is already set resolves the sleep
//! immediately at registration.
//!
//! # Cancellation
//!
//! [`Scheduler::cancel`] removes a sleeper by identity and resolves it
//! as `Canceled`; `cancel_ok` and `cancel_err` resolve it with a value
//! or an error instead. Dropping the scheduler stops the worker and
//! cancels everything still scheduled.

use crate::alert::{AlertFlag, Ident};
use crate::handle::{Handle, ResultChannel};
use crate::prepared::PreparedTask;
use crate::time::TimerHeap;
use crate::Error;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct SchedState {
    heap: TimerHeap<ResultChannel<()>>,
    stop: bool,
}

struct SchedShared {
    state: Mutex<SchedState>,
    wakeup: Condvar,
}

impl SchedShared {
    fn state(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Files a sleeper, nudging the worker when the new entry becomes
    /// the earliest (or the only) deadline.
    fn schedule(&self, channel: ResultChannel<()>, deadline: Instant, ident: Ident) {
        let mut state = self.state();
        self.schedule_locked(&mut state, channel, deadline, ident);
    }

    fn schedule_locked(
        &self,
        state: &mut SchedState,
        channel: ResultChannel<()>,
        deadline: Instant,
        ident: Ident,
    ) {
        if state.heap.first_deadline().is_none_or(|first| deadline < first) {
            self.wakeup.notify_all();
        }
        state.heap.schedule(channel, deadline, ident);
    }

    fn worker(self: &Arc<Self>) {
        let mut state = self.state();
        loop {
            if state.stop {
                return;
            }
            match state.heap.first_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        let channel = state.heap.pop_first().expect("deadline came from an entry");
                        drop(state);
                        tracing::trace!("timer fired");
                        channel.set(()).resume();
                        state = self.state();
                    } else {
                        let (relocked, _) = self
                            .wakeup
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner);
                        state = relocked;
                    }
                }
                None => {
                    state = self
                        .wakeup
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

/// Timer heap plus worker loop: `sleep_until`, alertable sleeps, and
/// cancel-by-identity.
pub struct Scheduler {
    shared: Arc<SchedShared>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates a scheduler and spawns its worker thread.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(SchedShared {
            state: Mutex::new(SchedState {
                heap: TimerHeap::new(),
                stop: false,
            }),
            wakeup: Condvar::new(),
        });
        let runner = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("scheduler-worker".into())
            .spawn(move || runner.worker())
            .expect("spawn scheduler worker");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Sleeps until `deadline` under the anonymous identity.
    #[must_use]
    pub fn sleep_until(&self, deadline: Instant) -> Handle<()> {
        self.sleep_until_ident(deadline, Ident::NONE)
    }

    /// Sleeps until `deadline`, filed under `ident` for cancellation.
    #[must_use]
    pub fn sleep_until_ident(&self, deadline: Instant, ident: Ident) -> Handle<()> {
        let shared = Arc::clone(&self.shared);
        Handle::deferred_fn(move |channel| {
            shared.schedule(channel, deadline, ident);
            PreparedTask::empty()
        })
    }

    /// Sleeps for `duration` under the anonymous identity.
    #[must_use]
    pub fn sleep_for(&self, duration: Duration) -> Handle<()> {
        self.sleep_until(Instant::now() + duration)
    }

    /// Sleeps for `duration`, filed under `ident` for cancellation.
    #[must_use]
    pub fn sleep_for_ident(&self, duration: Duration, ident: Ident) -> Handle<()> {
        self.sleep_until_ident(Instant::now() + duration, ident)
    }

    /// Sleeps until `deadline` unless `flag` is (or becomes) alerted.
    ///
    /// A flag that is already set at registration resolves the sleep
    /// immediately. Either way the sleep resolves with a value; the
    /// caller distinguishes alert from timeout by checking the flag.
    #[must_use]
    pub fn sleep_until_alertable(&self, flag: &AlertFlag, deadline: Instant) -> Handle<()> {
        let shared = Arc::clone(&self.shared);
        let flag = flag.clone();
        Handle::deferred_fn(move |channel| {
            // Flag check and registration share one lock acquisition, so
            // an alert cannot slip between them.
            let mut state = shared.state();
            if flag.is_set() {
                drop(state);
                return channel.set(());
            }
            shared.schedule_locked(&mut state, channel, deadline, flag.ident());
            PreparedTask::empty()
        })
    }

    /// Alertable [`Scheduler::sleep_for`].
    #[must_use]
    pub fn sleep_for_alertable(&self, flag: &AlertFlag, duration: Duration) -> Handle<()> {
        self.sleep_until_alertable(flag, Instant::now() + duration)
    }

    /// Sets the flag and wakes the sleeper filed under it.
    ///
    /// If that party is mid-sleep its deadline jumps to now and it
    /// resolves on the next worker pass; if it is not sleeping yet, the
    /// set flag short-circuits its next alertable sleep.
    pub fn alert(&self, flag: &AlertFlag) {
        let mut state = self.shared.state();
        flag.set();
        if state.heap.set_time(flag.ident(), Instant::now()) {
            tracing::debug!("alert advanced a sleeper to now");
            self.shared.wakeup.notify_all();
        }
    }

    /// Cancels the sleeper filed under `ident`; it observes `Canceled`.
    ///
    /// Returns the sleeper's resumption; empty if nothing matched.
    pub fn cancel(&self, ident: Ident) -> PreparedTask {
        match self.remove(ident) {
            Some(channel) => channel.drop_empty(),
            None => PreparedTask::empty(),
        }
    }

    /// Cancels the sleeper filed under `ident`, resolving it with a
    /// value as if its deadline had passed.
    pub fn cancel_ok(&self, ident: Ident) -> PreparedTask {
        match self.remove(ident) {
            Some(channel) => channel.set(()),
            None => PreparedTask::empty(),
        }
    }

    /// Cancels the sleeper filed under `ident` with an error.
    pub fn cancel_err(&self, ident: Ident, error: Error) -> PreparedTask {
        match self.remove(ident) {
            Some(channel) => channel.set_error(error),
            None => PreparedTask::empty(),
        }
    }

    /// The earliest scheduled deadline, if any.
    #[must_use]
    pub fn first_deadline(&self) -> Option<Instant> {
        self.shared.state().heap.first_deadline()
    }

    fn remove(&self, ident: Ident) -> Option<ResultChannel<()>> {
        self.shared.state().heap.remove_by_ident(ident)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let leftovers: Vec<_> = {
            let mut state = self.shared.state();
            state.stop = true;
            state.heap.drain().collect()
        };
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        // Sleepers outlive the scheduler as Canceled.
        drop(leftovers);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("scheduled", &self.shared.state().heap.len())
            .finish()
    }
}
