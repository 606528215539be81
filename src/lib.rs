//! Handoff: a self-contained substrate for cooperative async hand-offs.
//!
//! # Overview
//!
//! Handoff is built around one value-bearing entity: the async handle.
//! A [`Handle<T>`] represents "a `T` that will exist"; it carries its own
//! producer until the first observation arms it, and it has exactly one
//! consumer. The producer writes through a [`ResultChannel<T>`], which
//! hands back the consumer's resumption as a [`PreparedTask`], so locks
//! are released before anyone runs and continuations execute on
//! whichever thread completed the producer. There is no runtime, no
//! thread pool, and no I/O layer underneath.
//!
//! # Core Guarantees
//!
//! - **Single hand-off**: at most one consumer per handle; one terminal
//!   write per channel
//! - **No silent cancellation**: a producer that unwinds forwards its
//!   failure; a dropped channel is observed as `Canceled`, never as a
//!   hang
//! - **No detached losses**: producers with no consumer still run, and
//!   their errors hit a process-wide hook (fatal by default)
//! - **Bounded critical sections**: no user code runs under an internal
//!   lock; resumptions are returned as [`PreparedTask`]s instead
//!
//! # Module Structure
//!
//! - [`handle`][mod@handle]: the handle/channel state machine (the core)
//! - [`task`]: producer tasks that drive themselves on wake
//! - [`prepared`]: resumable continuations, resume-on-drop
//! - [`alert`]: one-shot alert flags with stable identities
//! - [`combinator`]: wait-for-all and wait-each-in-completion-order
//! - [`sync`]: async mutex with FIFO ownership transfer, multi-lock
//! - [`channel`]: identity-keyed broadcast, bounded queue
//! - [`generator`][mod@generator]: lazy, possibly-suspending sequence producers
//! - [`time`]: timer heap and the sleep/alert/cancel scheduler
//! - [`error`]: error taxonomy and the detached-error hook

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod alert;
pub mod channel;
pub mod combinator;
pub mod error;
pub mod generator;
pub mod handle;
pub mod prepared;
pub mod sync;
pub mod task;
pub mod time;

pub use alert::{AlertFlag, Ident};
pub use channel::{BoundedQueue, Distributor};
pub use combinator::{WaitAll, WaitEach};
pub use error::{set_detached_error_hook, DetachedErrorHook, Error, ErrorKind, Result};
pub use generator::{GenIter, Generator, YieldHandle};
pub use handle::{Handle, ReleasedChannel, ResultChannel};
pub use prepared::{PreparedList, PreparedTask};
pub use sync::{MultiLock, Mutex, Ownership, TryLockError};
pub use task::Task;
pub use time::{Scheduler, TimerHeap};
