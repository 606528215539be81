//! One-shot alert signal with a stable identity.
//!
//! An [`AlertFlag`] is a relaxed atomic boolean shared between the party
//! raising an alert and the party that sleeps or subscribes alertably.
//! Its allocation address doubles as the identity under which the
//! scheduler and the distributor file the corresponding waiter, so
//! raising the alert can locate and wake exactly that waiter.
//!
//! Cloning an `AlertFlag` clones the *handle*; all clones share one flag
//! and one identity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An opaque identity token.
///
/// Used to key scheduler entries and distributor subscriptions. Derived
/// from an address ([`Ident::of`], [`AlertFlag::ident`]) or chosen by the
/// caller. Identities are compared, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ident(usize);

impl Ident {
    /// The anonymous identity.
    pub const NONE: Self = Self(0);

    /// Derives an identity from a value's address.
    ///
    /// Stable only as long as the referent does not move.
    #[must_use]
    pub fn of<T>(value: &T) -> Self {
        Self(std::ptr::from_ref(value) as usize)
    }

    /// Builds an identity from an arbitrary caller-chosen token.
    #[must_use]
    pub const fn from_token(token: usize) -> Self {
        Self(token)
    }
}

/// A one-shot wake-and-prevent signal.
///
/// Two idioms:
///
/// - as the identity of an alertable sleep: the scheduler files the
///   sleeper under [`AlertFlag::ident`], and `alert` both sets the flag
///   and advances that sleeper's deadline to now;
/// - as the early-exit signal for a registration: the registration site
///   observes the flag under its internal lock and, if set, refuses to
///   register (the caller observes `Canceled`).
#[derive(Debug, Clone, Default)]
pub struct AlertFlag {
    flag: Arc<AtomicBool>,
}

impl AlertFlag {
    /// Creates a new flag in the cleared state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag.
    pub fn set(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Clears the flag.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    /// Returns the flag value and clears it in one step.
    pub fn test_and_reset(&self) -> bool {
        self.flag.swap(false, Ordering::Relaxed)
    }

    /// Returns the current flag value.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Returns the identity shared by all clones of this flag.
    #[must_use]
    pub fn ident(&self) -> Ident {
        Ident(Arc::as_ptr(&self.flag) as usize)
    }
}
