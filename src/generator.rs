//! Lazy, possibly-suspending producer of a sequence of values.
//!
//! A [`Generator`] runs a caller-supplied body that yields values through
//! a [`YieldHandle`]. Construction leaves the body suspended; each
//! [`Generator::invoke`] produces a [`Handle<T>`] that, once observed,
//! resumes the body until its next yield. The yielded value travels
//! through that invocation's result channel, and for parameterised
//! generators the yield expression resolves to the *next* invocation's
//! parameter.
//!
//! ```ignore
//! let mut fib = Generator::new(|mut gen| async move {
//!     let (mut a, mut b) = (1u64, 1);
//!     for _ in 0..10 {
//!         gen.yield_value(a).await;
//!         (a, b) = (b, a + b);
//!     }
//!     Ok(())
//! });
//! for value in fib.iter() {
//!     println!("{}", value?);
//! }
//! ```
//!
//! When the body returns, the pending invocation (if any) resolves empty:
//! the consumer observes `Canceled`, which is the stop condition. The
//! body may await arbitrary handles between yields.
//!
//! Single consumer: resolve each invocation before making the next one.

use crate::error::ErrorKind;
use crate::handle::{Handle, ResultChannel};
use crate::prepared::PreparedTask;
use crate::task::Task;
use crate::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

struct GenSlot<T, P> {
    /// The current invocation's write capability.
    channel: Option<ResultChannel<T>>,
    /// Parameter carried by the latest invocation.
    param: Option<P>,
    started: bool,
    finished: bool,
    /// A failure that happened with no invocation pending; delivered to
    /// the next invocation.
    failure: Option<Error>,
}

struct GenShared<T, P> {
    slot: Mutex<GenSlot<T, P>>,
}

impl<T, P> GenShared<T, P> {
    fn slot(&self) -> MutexGuard<'_, GenSlot<T, P>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A suspended sequence producer. See the [module docs](self).
pub struct Generator<T, P = ()> {
    shared: Arc<GenShared<T, P>>,
    /// Wakes (re-polls) the generator body.
    frame: Waker,
}

impl<T: Send + 'static, P: Send + 'static> Generator<T, P> {
    /// Builds a generator from its body.
    ///
    /// The body receives the [`YieldHandle`] and runs only when the
    /// first invocation is observed.
    pub fn new<B, Fut>(body: B) -> Self
    where
        B: FnOnce(YieldHandle<T, P>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let shared = Arc::new(GenShared {
            slot: Mutex::new(GenSlot {
                channel: None,
                param: None,
                started: false,
                finished: false,
                failure: None,
            }),
        });
        let body = body(YieldHandle {
            shared: Arc::clone(&shared),
        });
        let epilogue = Arc::clone(&shared);
        let task: Task<()> = Task::new(async move {
            let outcome = body.await;
            let channel = {
                let mut slot = epilogue.slot();
                slot.finished = true;
                match &outcome {
                    Ok(()) => {}
                    Err(error) => {
                        if slot.channel.is_none() {
                            slot.failure = Some(error.clone());
                        }
                    }
                }
                slot.channel.take()
            };
            match (outcome, channel) {
                (Err(error), Some(channel)) => channel.set_error(error).resume(),
                // No pending invocation: the failure waits in the slot.
                (Err(_), None) => {}
                // A clean finish cancels the pending invocation.
                (Ok(()), channel) => drop(channel),
            }
            Ok(())
        });
        let frame = task.start(ResultChannel::detached()).into_waker();
        Self { shared, frame }
    }

    /// Requests the next value, passing `param` to the suspended yield.
    ///
    /// The returned handle resolves with the next yielded value, or
    /// `Canceled` once the body has finished.
    #[must_use]
    pub fn invoke(&mut self, param: P) -> Handle<T> {
        self.invocation(Some(param))
    }

    /// Performs the first invocation with no parameter.
    ///
    /// Use this to reach the initial yield of a parameterised generator.
    /// Returns an Empty handle if the generator has already started.
    #[must_use]
    pub fn start(&mut self) -> Handle<T> {
        if self.shared.slot().started {
            return Handle::empty();
        }
        self.invocation(None)
    }

    /// Returns true once the body has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.slot().finished
    }

    fn invocation(&mut self, param: Option<P>) -> Handle<T> {
        {
            let mut slot = self.shared.slot();
            if slot.finished {
                return match slot.failure.take() {
                    Some(error) => Handle::error(error),
                    None => Handle::empty(),
                };
            }
        }
        let shared = Arc::clone(&self.shared);
        let frame = self.frame.clone();
        Handle::deferred_fn(move |channel| {
            {
                let mut slot = shared.slot();
                // The body may have finished between the call and the arm.
                if slot.finished {
                    let failure = slot.failure.take();
                    drop(slot);
                    return match failure {
                        Some(error) => channel.set_error(error),
                        None => channel.drop_empty(),
                    };
                }
                assert!(
                    slot.channel.is_none(),
                    "previous generator invocation is still pending"
                );
                slot.started = true;
                slot.param = param;
                slot.channel = Some(channel);
            }
            PreparedTask::from_waker(frame)
        })
    }
}

impl<T: Send + 'static> Generator<T, ()> {
    /// Iterates the generated sequence, blocking per item.
    ///
    /// The iterator ends when the body finishes (`Canceled` is the stop
    /// condition); other errors are yielded as items.
    pub fn iter(&mut self) -> GenIter<'_, T> {
        GenIter { gen: self }
    }
}

impl<T, P> std::fmt::Debug for Generator<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.shared.slot();
        f.debug_struct("Generator")
            .field("started", &slot.started)
            .field("finished", &slot.finished)
            .finish()
    }
}

/// Blocking iterator over a parameterless generator.
pub struct GenIter<'a, T> {
    gen: &'a mut Generator<T, ()>,
}

impl<T: Send + 'static> Iterator for GenIter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut handle = self.gen.invoke(());
        match handle.wait() {
            Ok(value) => Some(Ok(value)),
            Err(error) if error.kind() == ErrorKind::Canceled => None,
            Err(error) => Some(Err(error)),
        }
    }
}

/// The generator body's side of the exchange.
pub struct YieldHandle<T, P = ()> {
    shared: Arc<GenShared<T, P>>,
}

impl<T: Send + 'static, P: Send + 'static> YieldHandle<T, P> {
    /// Delivers `value` to the current invocation and suspends until the
    /// next one, resolving with its parameter.
    pub fn yield_value(&mut self, value: T) -> YieldFuture<'_, T, P> {
        YieldFuture {
            shared: self.shared.as_ref(),
            value: Some(value),
        }
    }
}

impl<T, P> std::fmt::Debug for YieldHandle<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YieldHandle").finish_non_exhaustive()
    }
}

/// Future returned by [`YieldHandle::yield_value`].
pub struct YieldFuture<'a, T, P> {
    shared: &'a GenShared<T, P>,
    value: Option<T>,
}

impl<T, P> Unpin for YieldFuture<'_, T, P> {}

impl<T, P> Future for YieldFuture<'_, T, P> {
    type Output = P;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<P> {
        let this = self.get_mut();
        if let Some(value) = this.value.take() {
            let prepared = {
                let mut slot = this.shared.slot();
                let channel = slot
                    .channel
                    .take()
                    .expect("yield with no pending invocation");
                drop(slot);
                channel.set(value)
            };
            prepared.resume();
            // Parked: the next invocation wakes the body frame directly.
            return Poll::Pending;
        }
        let mut slot = this.shared.slot();
        if slot.channel.is_some() {
            let param = slot.param.take().expect("invocation carried no parameter");
            return Poll::Ready(param);
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_sequence_then_canceled() {
        let mut gen = Generator::new(|mut out| async move {
            for i in 1..=3u32 {
                out.yield_value(i).await;
            }
            Ok(())
        });

        assert_eq!(gen.invoke(()).wait().expect("first"), 1);
        assert_eq!(gen.invoke(()).wait().expect("second"), 2);
        assert_eq!(gen.invoke(()).wait().expect("third"), 3);
        let err = gen.invoke(()).wait().expect_err("exhausted");
        assert_eq!(err.kind(), ErrorKind::Canceled);
        assert!(gen.is_finished());
    }

    #[test]
    fn iterator_adapter_stops_on_exhaustion() {
        let mut gen = Generator::new(|mut out| async move {
            let (mut a, mut b) = (1u64, 1);
            for _ in 0..5 {
                out.yield_value(a).await;
                (a, b) = (b, a + b);
            }
            Ok(())
        });

        let values: Vec<u64> = gen.iter().map(|item| item.expect("value")).collect();
        assert_eq!(values, vec![1, 1, 2, 3, 5]);
    }

    #[test]
    fn parameters_flow_back_into_the_body() {
        let mut gen: Generator<i64, i64> = Generator::new(|mut out| async move {
            let mut total = 0;
            for _ in 0..3 {
                total += out.yield_value(total).await;
            }
            Ok(())
        });

        assert_eq!(gen.start().wait().expect("initial yield"), 0);
        assert_eq!(gen.invoke(5).wait().expect("after 5"), 5);
        assert_eq!(gen.invoke(7).wait().expect("after 7"), 12);
        let err = gen.invoke(100).wait().expect_err("exhausted");
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[test]
    fn start_twice_yields_empty() {
        let mut gen: Generator<u32, u32> = Generator::new(|mut out| async move {
            out.yield_value(1).await;
            Ok(())
        });
        assert_eq!(gen.start().wait().expect("first start"), 1);
        let err = gen.start().wait().expect_err("second start");
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[test]
    fn body_error_reaches_the_next_invocation() {
        let mut gen: Generator<u32, ()> = Generator::new(|mut out| async move {
            out.yield_value(1).await;
            Err(Error::invalid_state().with_context("body failed"))
        });

        assert_eq!(gen.invoke(()).wait().expect("first"), 1);
        let err = gen.invoke(()).wait().expect_err("failure surfaces");
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        // Afterwards the generator is plain finished.
        let err = gen.invoke(()).wait().expect_err("exhausted");
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[test]
    fn body_may_await_between_yields() {
        let mut gen = Generator::new(|mut out| async move {
            let upstream: Handle<u32> = Handle::deferred_fn(|channel| {
                std::thread::spawn(move || {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    channel.set(40).resume();
                });
                PreparedTask::empty()
            });
            let base = upstream.await?;
            out.yield_value(base + 1).await;
            out.yield_value(base + 2).await;
            Ok(())
        });

        assert_eq!(gen.invoke(()).wait().expect("first"), 41);
        assert_eq!(gen.invoke(()).wait().expect("second"), 42);
        assert!(gen.iter().next().is_none());
    }

    #[test]
    fn unstarted_generator_never_runs() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let gen: Generator<u32, ()> = Generator::new(|mut out| async move {
            ran2.store(true, Ordering::SeqCst);
            out.yield_value(1).await;
            Ok(())
        });
        assert!(!gen.is_finished());
        drop(gen);
        assert!(!ran.load(Ordering::SeqCst));
    }
}
