//! Synchronization primitives built on the async handle.
//!
//! - [`Mutex`]: async mutual exclusion with FIFO ownership transfer
//! - [`MultiLock`]: deadlock-avoiding acquisition of a mutex set

mod mutex;

pub use mutex::{MultiLock, Mutex, Ownership, TryLockError};
