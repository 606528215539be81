//! Fan-out broadcast to subscribers keyed by identity.
//!
//! A [`Distributor`] holds one pending result channel per subscriber.
//! Broadcasting drains every registration, resolving each with a copy of
//! the value; a subscriber that wants the next broadcast subscribes
//! again. Registrations are keyed by an [`Ident`] so that individual
//! subscribers can be kicked out (resolved by hand) without a
//! broadcast.
//!
//! No user code runs under the distributor lock: broadcast collects the
//! woken consumers as [`PreparedTask`]s and resumes them after the lock
//! is released (or hands them to the caller in the buffered variant).
//!
//! # Alertable subscription
//!
//! [`Distributor::subscribe_alertable`] couples a registration to an
//! [`AlertFlag`]. [`Distributor::alert`] sets the flag and kicks out the
//! registration keyed by the flag's identity; a flag that is already set
//! refuses the registration outright, so the subscriber observes
//! `Canceled` either way and can check the flag.

use crate::alert::{AlertFlag, Ident};
use crate::handle::Handle;
use crate::prepared::{PreparedList, PreparedTask};
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Subscription<T> {
    channel: crate::ResultChannel<T>,
    ident: Ident,
}

struct DistInner<T> {
    subs: Mutex<Vec<Subscription<T>>>,
    /// Guards the single-broadcaster variant against concurrent use.
    broadcasting: AtomicBool,
}

impl<T> DistInner<T> {
    fn subs(&self) -> MutexGuard<'_, Vec<Subscription<T>>> {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Identity-keyed broadcast distributor.
///
/// Cloning yields another handle to the same distributor. When multiple
/// registrations share an ident, a kick-out removes an unspecified one
/// of them; keep idents unique per subscriber.
pub struct Distributor<T> {
    inner: Arc<DistInner<T>>,
}

impl<T> Clone for Distributor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for Distributor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Distributor<T> {
    /// Creates a distributor with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DistInner {
                subs: Mutex::new(Vec::new()),
                broadcasting: AtomicBool::new(false),
            }),
        }
    }

    /// Registers for the next broadcast under the given identity.
    ///
    /// The returned handle resolves with a copy of the broadcast value,
    /// or `Canceled` if the registration is kicked out or the
    /// distributor is dropped first. Registration happens when the
    /// handle is first observed.
    #[must_use]
    pub fn subscribe(&self, ident: Ident) -> Handle<T> {
        let inner = Arc::clone(&self.inner);
        Handle::deferred_fn(move |channel| {
            inner.subs().push(Subscription { channel, ident });
            PreparedTask::empty()
        })
    }

    /// Registers under a flag's identity, unless the flag is already set.
    ///
    /// A set flag refuses the registration: the channel is dropped under
    /// the lock and the subscriber observes `Canceled`.
    #[must_use]
    pub fn subscribe_alertable(&self, flag: &AlertFlag) -> Handle<T> {
        let inner = Arc::clone(&self.inner);
        let flag = flag.clone();
        Handle::deferred_fn(move |channel| {
            let mut subs = inner.subs();
            if flag.is_set() {
                drop(subs);
                return channel.drop_empty();
            }
            subs.push(Subscription {
                channel,
                ident: flag.ident(),
            });
            PreparedTask::empty()
        })
    }

    /// Broadcasts a value, collecting the woken subscribers into `buffer`.
    ///
    /// Every current registration is resolved with a clone of `value`
    /// and removed. The caller resumes the buffered tasks once its own
    /// locks are released; clearing or dropping the buffer resumes them
    /// all. Safe for concurrent broadcasters.
    pub fn broadcast_with(&self, value: &T, buffer: &mut PreparedList)
    where
        T: Clone,
    {
        let mut subs = self.inner.subs();
        tracing::trace!(subscribers = subs.len(), "broadcasting");
        for sub in subs.drain(..) {
            buffer.push(sub.channel.set(value.clone()));
        }
    }

    /// Broadcasts a value and resumes the subscribers on this thread.
    ///
    /// Single-broadcaster variant: at most one thread may be inside
    /// `broadcast` at a time (concurrent registration and kick-out stay
    /// safe).
    ///
    /// # Panics
    ///
    /// Panics if another broadcast is in flight.
    pub fn broadcast(&self, value: &T)
    where
        T: Clone,
    {
        assert!(
            !self.inner.broadcasting.swap(true, Ordering::Acquire),
            "concurrent broadcast; use broadcast_with from multiple threads"
        );
        let mut ready = PreparedList::new();
        self.broadcast_with(value, &mut ready);
        drop(ready);
        self.inner.broadcasting.store(false, Ordering::Release);
    }

    /// Removes one registration by identity and resolves it by hand.
    ///
    /// The resolver receives the registration's write capability; its
    /// returned task is passed through. Empty if no registration matches.
    pub fn kick_out<R>(&self, ident: Ident, resolver: R) -> PreparedTask
    where
        R: FnOnce(crate::ResultChannel<T>) -> PreparedTask,
    {
        let channel = {
            let mut subs = self.inner.subs();
            let position = subs.iter().position(|sub| sub.ident == ident);
            position.map(|at| subs.swap_remove(at).channel)
        };
        match channel {
            Some(channel) => resolver(channel),
            None => PreparedTask::empty(),
        }
    }

    /// Kicks out one registration with an error.
    pub fn kick_out_err(&self, ident: Ident, error: Error) -> PreparedTask {
        self.kick_out(ident, move |channel| channel.set_error(error))
    }

    /// Kicks out one registration as `Canceled`.
    pub fn kick_out_cancel(&self, ident: Ident) -> PreparedTask {
        self.kick_out(ident, crate::ResultChannel::drop_empty)
    }

    /// Sets the flag and kicks out the registration it keys.
    ///
    /// The kicked subscriber observes `Canceled` and can consult the
    /// flag; the set flag also blocks its future alertable
    /// registrations.
    pub fn alert(&self, flag: &AlertFlag) -> PreparedTask {
        flag.set();
        self.kick_out_cancel(flag.ident())
    }

    /// Number of current registrations.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subs().len()
    }
}

impl<T> std::fmt::Debug for Distributor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor").finish_non_exhaustive()
    }
}
