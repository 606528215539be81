//! A producer task whose completion writes into a [`Handle`].
//!
//! [`Task<T>`] wraps a future resolving to `Result<T, Error>`. It is the
//! coroutine-shaped companion of [`Handle<T>`]: created suspended, armed
//! by the first observation of its handle, and from then on it drives
//! itself: every wake re-polls the task on the waking thread, so a chain
//! of producers and consumers runs cooperatively without any runtime.
//!
//! A task dropped without ever being started still executes, *detached*:
//! it runs on the dropping thread until its first suspension and is woken
//! onward by whatever it awaits. A detached task has no consumer, so a
//! failure is routed to the process-wide hook
//! ([`crate::set_detached_error_hook`]).
//!
//! [`Handle`]: crate::Handle
//! [`Handle<T>`]: crate::Handle

use crate::error::Result;
use crate::handle::ResultChannel;
use crate::prepared::PreparedTask;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Wake, Waker};

type Starter<T> = Box<dyn FnOnce(ResultChannel<T>) -> PreparedTask + Send>;

/// A suspended unit of work that will produce one `T`.
///
/// Convert it into an awaitable container with [`crate::Handle::deferred`]
/// (or `Handle::from`), or start it by hand with [`Task::start`].
#[must_use = "a dropped task runs detached"]
pub struct Task<T> {
    starter: Option<Starter<T>>,
}

impl<T> Task<T> {
    /// Wraps a future into a suspended task.
    ///
    /// The future does not run until the task is started.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let starter: Starter<T> = Box::new(move |channel| {
            let frame = Arc::new(TaskFrame {
                state: AtomicU8::new(IDLE),
                cell: Mutex::new(Some(FrameCell {
                    future: Box::pin(future),
                    channel,
                })),
            });
            PreparedTask::from_waker(Waker::from(frame))
        });
        Self {
            starter: Some(starter),
        }
    }

    /// Arms the task: its completion will write into `channel`.
    ///
    /// Returns the task's initial resumption. Resuming it (or dropping
    /// the returned value) polls the task until its first suspension.
    pub fn start(mut self, channel: ResultChannel<T>) -> PreparedTask {
        let starter = self.starter.take().expect("task already started");
        starter(channel)
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Some(starter) = self.starter.take() {
            starter(ResultChannel::detached()).resume();
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("started", &self.starter.is_none())
            .finish()
    }
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const DONE: u8 = 3;

struct FrameCell<T> {
    future: Pin<Box<dyn Future<Output = Result<T>> + Send>>,
    channel: ResultChannel<T>,
}

/// The self-driving frame behind a started task.
///
/// Waking the frame polls it on the waking thread. The state machine
/// keeps at most one poller active: a wake that arrives while the frame
/// is mid-poll marks it `NOTIFIED`, and the active poller loops once
/// more instead of a second thread entering.
struct TaskFrame<T> {
    state: AtomicU8,
    cell: Mutex<Option<FrameCell<T>>>,
}

impl<T: Send + 'static> TaskFrame<T> {
    fn run(self: &Arc<Self>) {
        loop {
            match self
                .state
                .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(RUNNING) => {
                    if self
                        .state
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                Err(_) => return,
            }
        }

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        loop {
            let Some(mut cell) = self.take_cell() else {
                self.state.store(DONE, Ordering::Release);
                return;
            };
            match cell.future.as_mut().poll(&mut cx) {
                Poll::Ready(output) => {
                    self.state.store(DONE, Ordering::Release);
                    let prepared = match output {
                        Ok(value) => cell.channel.set(value),
                        Err(error) => cell.channel.set_error(error),
                    };
                    prepared.resume();
                    return;
                }
                Poll::Pending => {
                    // Park the frame again before giving up RUNNING, so a
                    // concurrent wake always finds the cell in place.
                    self.put_cell(cell);
                    match self.state.compare_exchange(
                        RUNNING,
                        IDLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(_) => {
                            // A wake arrived while polling; go again.
                            self.state.store(RUNNING, Ordering::Release);
                        }
                    }
                }
            }
        }
    }

    fn take_cell(&self) -> Option<FrameCell<T>> {
        self.cell
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn put_cell(&self, cell: FrameCell<T>) {
        *self.cell.lock().unwrap_or_else(PoisonError::into_inner) = Some(cell);
    }
}

impl<T: Send + 'static> Wake for TaskFrame<T> {
    fn wake(self: Arc<Self>) {
        self.run();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.run();
    }
}
