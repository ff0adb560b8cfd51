//! Worker cores and the providers that hand them out.
//!
//! A [`WorkerCore`] is one reserved unit of build-execution capacity. It is
//! produced by a [`WorkerCoreProvider`], owned by exactly one party at a time
//! (an obtainment state, a request, or the caller that took it), and released
//! back to its origin by [`WorkerCore::dispose`].
//!
//! Some cores can report whether their backing executor is still reachable.
//! That capability is optional and discovered through
//! [`WorkerCore::liveness`]; fulfillers probe it right before handing a core
//! to a request.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use prometheus_core_pool::core::{AppResult, WorkerCore, WorkerCoreProvider};
//! use tokio_util::sync::CancellationToken;
//!
//! struct LocalCore;
//!
//! #[async_trait]
//! impl WorkerCore for LocalCore {
//!     async fn dispose(self) {}
//! }
//!
//! struct LocalProvider;
//!
//! #[async_trait]
//! impl WorkerCoreProvider<LocalCore> for LocalProvider {
//!     fn id(&self) -> &str {
//!         "local"
//!     }
//!
//!     async fn request_core(&self, _cancel: CancellationToken) -> AppResult<LocalCore> {
//!         Ok(LocalCore)
//!     }
//! }
//! ```

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::error::AppResult;

/// One reserved unit of execution capacity.
#[async_trait]
pub trait WorkerCore: Send + Sync + 'static {
    /// Release the capacity back to where it came from.
    ///
    /// The pool calls this exactly once for every core it does not hand to a
    /// caller.
    async fn dispose(self);

    /// Liveness capability, if the core supports probing.
    fn liveness(&self) -> Option<&dyn WorkerCoreLiveness> {
        None
    }
}

/// Optional capability of a core that can tell whether it is still usable.
#[async_trait]
pub trait WorkerCoreLiveness: Send + Sync {
    /// Probe the executor behind the core.
    ///
    /// Returning `false` means the core must be disposed and never handed out.
    async fn is_alive(&self, cancel: &CancellationToken) -> bool;
}

/// Something that can produce worker cores on demand.
///
/// Implementations may be slow (a remote agent may take seconds to reserve a
/// slot) and may fail; failures are logged by the fulfiller and retried.
#[async_trait]
pub trait WorkerCoreProvider<C: WorkerCore>: Send + Sync + 'static {
    /// Stable identity, unique within a provider collection.
    fn id(&self) -> &str;

    /// Obtain one core, honouring `cancel`.
    async fn request_core(&self, cancel: CancellationToken) -> AppResult<C>;
}

/// Probe a core's liveness, treating cores without the capability as alive.
pub async fn is_core_alive<C: WorkerCore>(core: &C, cancel: &CancellationToken) -> bool {
    match core.liveness() {
        Some(liveness) => liveness.is_alive(cancel).await,
        None => true,
    }
}
