//! The async handle: a value that will exist, and the write capability
//! that makes it exist.
//!
//! [`Handle<T>`] is the single container representing "a `T` (or an
//! error, or nothing) that may not yet exist". It collapses the usual
//! future/promise pair into one owner-held object: the producer side is
//! stored *inside* the handle until the first observation arms it.
//!
//! ```text
//! Empty ──attach──> Pending ──write──> Value | Error | Empty
//! Value | Error | Empty                        │
//!       └────────────────── observed ──────────┘
//! Deferred* ──attach──> (run producer) ──{sync result | Pending}──> …
//! ```
//!
//! A handle has at most one consumer. The consumer attaches by awaiting
//! the handle (it implements [`Future`]), by a blocking [`Handle::wait`],
//! or by [`Handle::attach_callback`]. The first attach arms the producer,
//! which receives a [`ResultChannel`]; writing the channel installs the
//! terminal state and returns the consumer as a [`PreparedTask`].
//!
//! # Cancellation
//!
//! There is no cancellation token. Dropping the `ResultChannel` without
//! writing it resolves the handle as `Empty`, which the consumer observes
//! as [`ErrorKind::Canceled`]. A channel dropped while a panic is
//! unwinding forwards the failure as [`ErrorKind::Panicked`] instead of
//! silently dropping it.

use crate::error::{invoke_detached_hook, Error, ErrorKind, Result};
use crate::prepared::PreparedTask;
use crate::task::Task;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Wake, Waker};

/// A deferred producer: invoked with the write capability on first
/// observation, returns the party that should run first (if any).
type Producer<T> = Box<dyn FnOnce(ResultChannel<T>) -> PreparedTask + Send>;

enum State<T> {
    /// Resolved with no value; observed as `Canceled`.
    Empty,
    /// Resolved with a result.
    Value(T),
    /// Resolved with an error.
    Error(Error),
    /// Producer is a suspended task; runs on first observation.
    Deferred(Task<T>),
    /// Producer is a one-shot function; runs on first observation.
    DeferredFn(Producer<T>),
    /// Producer has started; the slot holds the consumer to resume.
    Pending(Option<Waker>),
}

impl<T> State<T> {
    const fn is_ready(&self) -> bool {
        matches!(self, Self::Empty | Self::Value(_) | Self::Error(_))
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::Value(_) => "Value",
            Self::Error(_) => "Error",
            Self::Deferred(_) => "Deferred",
            Self::DeferredFn(_) => "DeferredFn",
            Self::Pending(_) => "Pending",
        }
    }

    /// Takes the terminal result. Values move out (leaving `Empty`),
    /// errors are cloned in place so later observations repeat them.
    fn take_terminal(&mut self) -> Result<T> {
        match self {
            Self::Value(_) => match mem::replace(self, Self::Empty) {
                Self::Value(value) => Ok(value),
                _ => unreachable!(),
            },
            Self::Error(error) => Err(error.clone()),
            Self::Empty => Err(Error::canceled()),
            _ => Err(Error::invalid_state().with_context("handle is not ready")),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

impl<T> Inner<T> {
    /// Locks the state, recovering from poisoning. No user code runs
    /// under this lock, so a poisoned lock left by an unwinding writer
    /// still guards a coherent state.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a producer wrote into the channel.
enum Written<T> {
    Value(T),
    Error(Error),
    Empty,
}

/// The async handle. See the [module docs](self) for the state machine.
pub struct Handle<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Handle<T> {
    fn from_state(state: State<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
            }),
        }
    }

    /// Creates a resolved handle with no value.
    ///
    /// Awaiting it fails with [`ErrorKind::Canceled`].
    #[must_use]
    pub fn empty() -> Self {
        Self::from_state(State::Empty)
    }

    /// Creates a resolved handle carrying `value`.
    #[must_use]
    pub fn ready(value: T) -> Self {
        Self::from_state(State::Value(value))
    }

    /// Creates a resolved handle carrying an error.
    #[must_use]
    pub fn error(error: Error) -> Self {
        Self::from_state(State::Error(error))
    }

    /// Creates a handle whose producer is a suspended [`Task`].
    ///
    /// The task does not run until the first observation arms it.
    #[must_use]
    pub fn deferred(task: Task<T>) -> Self {
        Self::from_state(State::Deferred(task))
    }

    /// Creates a handle whose producer is a one-shot function.
    ///
    /// On first observation `producer` receives the [`ResultChannel`]
    /// bound to this handle. It may write the channel synchronously, move
    /// it elsewhere for later completion, and may return a
    /// [`PreparedTask`] for a party that should run next.
    #[must_use]
    pub fn deferred_fn<F>(producer: F) -> Self
    where
        F: FnOnce(ResultChannel<T>) -> PreparedTask + Send + 'static,
    {
        Self::from_state(State::DeferredFn(Box::new(producer)))
    }

    /// Returns true if the handle is resolved (value, error, or empty).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.lock().is_ready()
    }

    /// Returns true if a producer has started and not yet written.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(&*self.inner.lock(), State::Pending(_))
    }

    /// Takes the resolved result without waiting.
    ///
    /// The value moves out (a second call observes `Canceled`); an error
    /// is cloned in place and repeats. Fails with
    /// [`ErrorKind::InvalidState`] if the handle is not ready.
    pub fn try_value(&mut self) -> Result<T> {
        self.inner.lock().take_terminal()
    }

    /// Produces an independent handle in the same terminal state.
    ///
    /// Defined only over ready handles: a pending or deferred handle
    /// copies as `Empty`. Never replicates a producer.
    #[must_use]
    pub fn copy_value(&self) -> Self
    where
        T: Clone,
    {
        match &*self.inner.lock() {
            State::Value(value) => Self::ready(value.clone()),
            State::Error(error) => Self::error(error.clone()),
            _ => Self::empty(),
        }
    }

    /// Arms the producer if needed and registers `waker` as the single
    /// consumer.
    ///
    /// Returns the party that should run first: the producer's initial
    /// resumption if the handle was deferred, or the consumer itself if
    /// the handle is already resolved.
    ///
    /// # Panics
    ///
    /// Panics if a consumer is already attached. A handle has at most one
    /// consumer across its lifetime.
    pub fn attach_consumer(&mut self, waker: Waker) -> PreparedTask {
        let producer = {
            let mut state = self.inner.lock();
            match &mut *state {
                State::Empty | State::Value(_) | State::Error(_) => {
                    return PreparedTask::from_waker(waker);
                }
                State::Pending(slot) => {
                    assert!(
                        slot.is_none(),
                        "second consumer attached to an async handle"
                    );
                    *slot = Some(waker);
                    return PreparedTask::empty();
                }
                State::Deferred(_) | State::DeferredFn(_) => {
                    match mem::replace(&mut *state, State::Pending(Some(waker))) {
                        State::Deferred(task) => ArmedProducer::Task(task),
                        State::DeferredFn(producer) => ArmedProducer::Fn(producer),
                        _ => unreachable!(),
                    }
                }
            }
        };
        producer.run(ResultChannel::attached(Arc::clone(&self.inner)))
    }

    /// Attaches a one-shot callback invoked with the resolved result.
    ///
    /// If the handle is already ready the callback runs inline and the
    /// returned task is empty. Otherwise the producer is armed; the
    /// returned task is the producer's initial resumption.
    pub fn attach_callback<F>(&mut self, callback: F) -> PreparedTask
    where
        F: FnOnce(Result<T>) + Send + 'static,
        T: Send + 'static,
    {
        {
            let mut state = self.inner.lock();
            if state.is_ready() {
                let outcome = state.take_terminal();
                drop(state);
                callback(outcome);
                return PreparedTask::empty();
            }
        }
        let frame = Arc::new(CallbackFrame {
            inner: Arc::clone(&self.inner),
            callback: Mutex::new(Some(Box::new(callback))),
        });
        self.attach_consumer(Waker::from(frame))
    }

    /// Blocks the calling thread until the handle resolves, then takes
    /// the result.
    ///
    /// Arms the producer like an await would; the producer may complete
    /// on this thread or on any other.
    pub fn wait(&mut self) -> Result<T> {
        futures_lite::future::block_on(std::future::poll_fn(|cx| self.poll_result(cx)))
    }

    fn poll_result(&mut self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        loop {
            let producer = {
                let mut state = self.inner.lock();
                match &mut *state {
                    State::Empty | State::Value(_) | State::Error(_) => {
                        return Poll::Ready(state.take_terminal());
                    }
                    State::Pending(slot) => {
                        *slot = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                    State::Deferred(_) | State::DeferredFn(_) => {
                        let pending = State::Pending(Some(cx.waker().clone()));
                        match mem::replace(&mut *state, pending) {
                            State::Deferred(task) => ArmedProducer::Task(task),
                            State::DeferredFn(producer) => ArmedProducer::Fn(producer),
                            _ => unreachable!(),
                        }
                    }
                }
            };
            // Run the producer outside the lock; it may write the channel
            // synchronously, so check the state again before parking.
            producer
                .run(ResultChannel::attached(Arc::clone(&self.inner)))
                .resume();
        }
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_result(cx)
    }
}

impl<T> From<Task<T>> for Handle<T> {
    fn from(task: Task<T>) -> Self {
        Self::deferred(task)
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("state", &self.inner.lock().name())
            .finish()
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        let state = mem::replace(&mut *self.inner.lock(), State::Empty);
        match state {
            State::Pending(_) => {
                // The producer still holds a channel into this handle.
                // Destroying the single consumer mid-flight is a
                // programming error; fail loudly unless already unwinding.
                assert!(
                    std::thread::panicking(),
                    "async handle dropped while pending; resolve or cancel it first"
                );
            }
            State::Deferred(task) => drop(task),
            State::DeferredFn(producer) => producer(ResultChannel::detached()).resume(),
            _ => {}
        }
    }
}

enum ArmedProducer<T> {
    Task(Task<T>),
    Fn(Producer<T>),
}

impl<T> ArmedProducer<T> {
    fn run(self, channel: ResultChannel<T>) -> PreparedTask {
        match self {
            Self::Task(task) => task.start(channel),
            Self::Fn(producer) => producer(channel),
        }
    }
}

/// A one-shot callback masquerading as a consumer.
struct CallbackFrame<T> {
    inner: Arc<Inner<T>>,
    #[allow(clippy::type_complexity)]
    callback: Mutex<Option<Box<dyn FnOnce(Result<T>) + Send>>>,
}

impl<T: Send + 'static> Wake for CallbackFrame<T> {
    fn wake(self: Arc<Self>) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            let outcome = self.inner.lock().take_terminal();
            callback(outcome);
        }
    }
}

enum Target<T> {
    Attached(Arc<Inner<T>>),
    Detached,
    Spent,
}

/// Exclusive write-once capability over a single pending [`Handle`].
///
/// Exactly one of `set`, `set_error`, `drop_empty`, `release` (or plain
/// drop) is applied over the channel's lifetime. Writing returns the
/// consumer as a [`PreparedTask`]; dropping that task resumes it.
///
/// A channel created for a producer running *detached* (its handle was
/// dropped unobserved) discards values and routes errors to the
/// process-wide hook set by [`crate::set_detached_error_hook`].
#[must_use = "an unused channel cancels the consumer when dropped"]
pub struct ResultChannel<T> {
    target: Target<T>,
}

impl<T> ResultChannel<T> {
    fn attached(inner: Arc<Inner<T>>) -> Self {
        Self {
            target: Target::Attached(inner),
        }
    }

    pub(crate) fn detached() -> Self {
        Self {
            target: Target::Detached,
        }
    }

    /// Returns true if a write through this channel reaches a consumer.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        matches!(self.target, Target::Attached(_))
    }

    /// Resolves the handle with a value.
    pub fn set(mut self, value: T) -> PreparedTask {
        Self::finish(mem::replace(&mut self.target, Target::Spent), Written::Value(value))
    }

    /// Resolves the handle with an error.
    pub fn set_error(mut self, error: Error) -> PreparedTask {
        Self::finish(mem::replace(&mut self.target, Target::Spent), Written::Error(error))
    }

    /// Resolves the handle empty; the consumer observes `Canceled`.
    pub fn drop_empty(mut self) -> PreparedTask {
        Self::finish(mem::replace(&mut self.target, Target::Spent), Written::Empty)
    }

    /// Parks the write obligation without resolving it.
    ///
    /// The handle stays pending until the returned token is re-armed via
    /// [`ReleasedChannel::rearm`] and written. Losing the token leaves
    /// the consumer waiting forever.
    pub fn release(mut self) -> ReleasedChannel<T> {
        ReleasedChannel {
            target: mem::replace(&mut self.target, Target::Spent),
        }
    }

    fn finish(target: Target<T>, written: Written<T>) -> PreparedTask {
        match target {
            Target::Attached(inner) => {
                let state = match written {
                    Written::Value(value) => State::Value(value),
                    Written::Error(error) => State::Error(error),
                    Written::Empty => State::Empty,
                };
                let consumer = match mem::replace(&mut *inner.lock(), state) {
                    State::Pending(waker) => waker,
                    // A released channel can be re-armed after the
                    // consumer state was already replaced; nothing to wake.
                    _ => None,
                };
                PreparedTask::from(consumer)
            }
            Target::Detached => {
                if let Written::Error(error) = written {
                    invoke_detached_hook(&error);
                }
                PreparedTask::empty()
            }
            Target::Spent => PreparedTask::empty(),
        }
    }
}

impl<T> Drop for ResultChannel<T> {
    fn drop(&mut self) {
        let target = mem::replace(&mut self.target, Target::Spent);
        if matches!(target, Target::Spent) {
            return;
        }
        // An unwinding producer forwards its failure instead of silently
        // cancelling the consumer.
        let written = if std::thread::panicking() {
            Written::Error(Error::new(ErrorKind::Panicked))
        } else {
            Written::Empty
        };
        Self::finish(target, written).resume();
    }
}

impl<T> std::fmt::Debug for ResultChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match self.target {
            Target::Attached(_) => "attached",
            Target::Detached => "detached",
            Target::Spent => "spent",
        };
        f.debug_struct("ResultChannel").field("target", &target).finish()
    }
}

/// A parked write obligation produced by [`ResultChannel::release`].
///
/// Dropping it does *not* resolve the handle.
#[must_use = "the parked obligation must be re-armed or the consumer waits forever"]
pub struct ReleasedChannel<T> {
    target: Target<T>,
}

impl<T> ReleasedChannel<T> {
    /// Restores the write capability.
    pub fn rearm(mut self) -> ResultChannel<T> {
        ResultChannel {
            target: mem::replace(&mut self.target, Target::Spent),
        }
    }
}

impl<T> std::fmt::Debug for ReleasedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleasedChannel").finish_non_exhaustive()
    }
}
