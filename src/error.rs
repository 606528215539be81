//! Error types and the detached-producer error hook.
//!
//! Every fallible observation of a [`crate::Handle`] resolves to this
//! module's [`Error`]. The taxonomy is deliberately small:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - User failures travel through handles verbatim, wrapped as `User`
//! - A producer that finishes without writing surfaces as `Canceled`
//!
//! Producers that run *detached* (no consumer ever attached) have nowhere
//! to deliver a failure, so their errors are routed to a process-wide hook
//! instead. The default hook is fatal: swallowing detached errors would
//! hide bugs.

use core::fmt;
use std::sync::{Arc, RwLock};

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The producer finished without writing a value.
    Canceled,
    /// An operation was attempted in a state that does not permit it.
    InvalidState,
    /// The queue was closed while waiting for an item.
    QueueClosed,
    /// A producer panicked while a result channel was outstanding.
    Panicked,
    /// A user-supplied error carried through a handle.
    User,
}

/// The main error type carried through handles.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Shorthand for a cancellation error.
    #[must_use]
    pub const fn canceled() -> Self {
        Self::new(ErrorKind::Canceled)
    }

    /// Shorthand for an invalid-state error.
    #[must_use]
    pub const fn invalid_state() -> Self {
        Self::new(ErrorKind::InvalidState)
    }

    /// Wraps a user error so it can travel through a handle.
    #[must_use]
    pub fn user(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::User).with_source(source)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self.kind, ErrorKind::Canceled)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Canceled => write!(f, "canceled")?,
            ErrorKind::InvalidState => write!(f, "invalid state")?,
            ErrorKind::QueueClosed => write!(f, "queue closed")?,
            ErrorKind::Panicked => write!(f, "producer panicked")?,
            ErrorKind::User => write!(f, "user error")?,
        }
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        if let Some(src) = &self.source {
            write!(f, ": {src}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized Result type for handle operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The detached-error hook signature.
///
/// The hook may be called from any thread. Returning from the hook ignores
/// the error and resumes normal execution, so a non-fatal hook is valid.
pub type DetachedErrorHook = fn(&Error);

fn default_detached_hook(error: &Error) {
    tracing::error!(%error, "detached producer failed with no consumer");
    std::process::abort();
}

static DETACHED_HOOK: RwLock<DetachedErrorHook> = RwLock::new(default_detached_hook);

/// Replaces the process-wide detached-error hook.
///
/// Call this once at program start, before any producer can run detached.
/// The default hook logs the error and aborts the process.
pub fn set_detached_error_hook(hook: DetachedErrorHook) {
    *DETACHED_HOOK.write().expect("hook lock poisoned") = hook;
}

/// Routes a detached producer's error to the process-wide hook.
pub(crate) fn invoke_detached_hook(error: &Error) {
    let hook = *DETACHED_HOOK.read().expect("hook lock poisoned");
    hook(error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        assert_eq!(Error::canceled().to_string(), "canceled");
        assert_eq!(Error::invalid_state().to_string(), "invalid state");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::QueueClosed).with_context("no consumers left");
        assert_eq!(err.to_string(), "queue closed: no consumers left");
    }

    #[test]
    fn source_chain_is_exposed() {
        use std::error::Error as _;
        let err = Error::user(Underlying);
        assert_eq!(err.kind(), ErrorKind::User);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn predicates_match_kind() {
        assert!(Error::canceled().is_canceled());
        assert!(!Error::invalid_state().is_canceled());
    }

    #[test]
    fn clone_preserves_kind_and_context() {
        let err = Error::user(Underlying).with_context("stage two");
        let copy = err.clone();
        assert_eq!(copy.kind(), ErrorKind::User);
        assert_eq!(copy.to_string(), err.to_string());
    }
}
