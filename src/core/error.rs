//! Error types for core allocation.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Caller-visible failures of the request registry and fulfillers.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The request already has a core assigned; assignment happens once.
    #[error("request {0} has already been fulfilled")]
    AlreadyFulfilled(Uuid),
    /// The request was disposed before a core was assigned.
    #[error("request {0} was disposed before it was fulfilled")]
    RequestDisposed(Uuid),
    /// The request was fulfilled but its core has already been taken.
    #[error("request {0} has no core available to take")]
    NoCoreAssigned(Uuid),
    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Whether this error represents cancellation rather than a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A core that could not be assigned to a request.
///
/// Ownership of the core goes back to the caller, who must dispose it.
pub struct FulfillRejected<C> {
    /// The core that was offered.
    pub core: C,
    /// Why the assignment was refused.
    pub reason: PoolError,
}

impl<C> FulfillRejected<C> {
    /// Split into the returned core and the refusal reason.
    pub fn into_parts(self) -> (C, PoolError) {
        (self.core, self.reason)
    }
}

impl<C> fmt::Debug for FulfillRejected<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FulfillRejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl<C> fmt::Display for FulfillRejected<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core rejected: {}", self.reason)
    }
}

/// Result alias for provider and application-level operations.
pub type AppResult<T> = Result<T, anyhow::Error>;
