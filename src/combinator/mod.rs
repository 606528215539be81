//! Composite waiters over multiple handles.
//!
//! [`WaitAll`] resolves once every added handle has fired;
//! [`WaitEach`] reports completions one at a time, in the order they
//! actually completed. Neither absorbs errors from its children:
//! retrieving a child's result re-raises whatever the child stored.

mod wait_all;
mod wait_each;

pub use wait_all::WaitAll;
pub use wait_each::WaitEach;
