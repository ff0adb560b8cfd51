//! Core requests and their locality preferences.
//!
//! A [`WorkerCoreRequest`] is a caller's claim on one core. It is created by
//! a [`WorkerCoreRequestCollection`], fulfilled by whichever fulfiller gets
//! to it first, and disposed by the caller once the work is done.
//!
//! Ownership of the assigned core stays with the request until the caller
//! takes it with [`WorkerCoreRequest::wait_for_core`] or
//! [`WorkerCoreRequest::take_core`]. A core that was never taken is disposed
//! together with the request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::core::error::{FulfillRejected, PoolError};
use crate::core::request_collection::WorkerCoreRequestCollection;
use crate::core::worker_core::WorkerCore;
use crate::util::clock::now_ms;

/// Where the caller wants its core to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreAllocationPreference {
    /// Must run on this machine.
    RequireLocal,
    /// Local if possible, remote otherwise.
    PreferLocal,
    /// Remote if possible, local otherwise.
    PreferRemote,
}

impl CoreAllocationPreference {
    /// Whether the request counts towards the local statistics.
    ///
    /// Only [`Self::RequireLocal`] is local; the other two are remotable.
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Self::RequireLocal)
    }
}

/// Which unfulfilled requests a fulfiller is willing to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreFulfillerConstraint {
    /// Every unfulfilled request.
    All,
    /// Only requests that require a local core.
    LocalRequiredOnly,
    /// Requests that require or prefer a local core.
    LocalRequiredAndPreferred,
    /// Remotable requests: those that prefer local or prefer remote.
    LocalPreferredAndRemote,
}

impl CoreFulfillerConstraint {
    /// Whether a request with `preference` passes this constraint.
    #[must_use]
    pub const fn admits(self, preference: CoreAllocationPreference) -> bool {
        use CoreAllocationPreference::{PreferLocal, PreferRemote, RequireLocal};
        match self {
            Self::All => true,
            Self::LocalRequiredOnly => matches!(preference, RequireLocal),
            Self::LocalRequiredAndPreferred => matches!(preference, RequireLocal | PreferLocal),
            Self::LocalPreferredAndRemote => matches!(preference, PreferLocal | PreferRemote),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestPhase {
    Pending,
    Fulfilled,
    Disposed,
}

struct CoreSlot<C> {
    assigned: bool,
    core: Option<C>,
}

/// Shared state of one request, referenced by the registry and the handle.
pub(crate) struct RequestState<C> {
    pub(crate) id: Uuid,
    pub(crate) preference: CoreAllocationPreference,
    pub(crate) created_at: Instant,
    pub(crate) created_at_ms: u128,
    slot: Mutex<CoreSlot<C>>,
    phase: watch::Sender<RequestPhase>,
    lock_acquired: AtomicBool,
}

impl<C: WorkerCore> RequestState<C> {
    pub(crate) fn new(preference: CoreAllocationPreference) -> Self {
        let (phase, _) = watch::channel(RequestPhase::Pending);
        Self {
            id: Uuid::new_v4(),
            preference,
            created_at: Instant::now(),
            created_at_ms: now_ms(),
            slot: Mutex::new(CoreSlot {
                assigned: false,
                core: None,
            }),
            phase,
            lock_acquired: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_assigned(&self) -> bool {
        self.slot.lock().assigned
    }

    pub(crate) fn is_lock_acquired(&self) -> bool {
        self.lock_acquired.load(Ordering::Acquire)
    }

    pub(crate) fn try_acquire_lock(&self) -> bool {
        self.lock_acquired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_lock(&self) {
        self.lock_acquired.store(false, Ordering::Release);
    }

    /// Assign `core`. The caller must hold the registry guard.
    pub(crate) fn assign(&self, core: C) -> Result<(), FulfillRejected<C>> {
        let mut slot = self.slot.lock();
        if slot.assigned {
            return Err(FulfillRejected {
                core,
                reason: PoolError::AlreadyFulfilled(self.id),
            });
        }
        if *self.phase.borrow() == RequestPhase::Disposed {
            return Err(FulfillRejected {
                core,
                reason: PoolError::RequestDisposed(self.id),
            });
        }
        slot.assigned = true;
        slot.core = Some(core);
        drop(slot);
        self.phase.send_replace(RequestPhase::Fulfilled);
        Ok(())
    }

    /// Close the completion signal and hand back any untaken core.
    ///
    /// The caller must hold the registry guard.
    pub(crate) fn mark_disposed(&self) -> Option<C> {
        let core = self.slot.lock().core.take();
        self.phase.send_if_modified(|phase| {
            if *phase == RequestPhase::Pending {
                *phase = RequestPhase::Disposed;
                true
            } else {
                false
            }
        });
        core
    }

    pub(crate) fn take_core(&self) -> Option<C> {
        self.slot.lock().core.take()
    }

    pub(crate) async fn wait_settled(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RequestPhase, PoolError> {
        let mut rx = self.phase.subscribe();
        let settled = async move {
            let phase = rx
                .wait_for(|phase| *phase != RequestPhase::Pending)
                .await?;
            Ok::<_, watch::error::RecvError>(*phase)
        };
        tokio::select! {
            biased;
            result = settled => result.map_err(|_| PoolError::RequestDisposed(self.id)),
            () = cancel.cancelled() => Err(PoolError::Cancelled),
        }
    }
}

/// A caller's claim on one worker core.
///
/// Dispose it with [`WorkerCoreRequest::dispose`] when the work is done.
/// Dropping it without disposing schedules the same cleanup on the current
/// tokio runtime.
pub struct WorkerCoreRequest<C: WorkerCore> {
    state: Arc<RequestState<C>>,
    collection: Arc<WorkerCoreRequestCollection<C>>,
    disposed: bool,
}

impl<C: WorkerCore> WorkerCoreRequest<C> {
    pub(crate) const fn new(
        state: Arc<RequestState<C>>,
        collection: Arc<WorkerCoreRequestCollection<C>>,
    ) -> Self {
        Self {
            state,
            collection,
            disposed: false,
        }
    }

    /// Unique request identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.state.id
    }

    /// Locality preference the request was created with.
    #[must_use]
    pub fn preference(&self) -> CoreAllocationPreference {
        self.state.preference
    }

    /// Wall-clock creation time in milliseconds.
    #[must_use]
    pub fn created_at_ms(&self) -> u128 {
        self.state.created_at_ms
    }

    /// Time since the request was created.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.state.created_at.elapsed()
    }

    /// Whether a core has been assigned. Never reverts once true.
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        self.state.is_assigned()
    }

    /// Wait until a core is assigned, leaving it owned by the request.
    ///
    /// # Errors
    ///
    /// [`PoolError::Cancelled`] if `cancel` fires first and
    /// [`PoolError::RequestDisposed`] if the request is disposed while pending.
    pub async fn wait_until_fulfilled(&self, cancel: &CancellationToken) -> Result<(), PoolError> {
        match self.state.wait_settled(cancel).await? {
            RequestPhase::Fulfilled => Ok(()),
            RequestPhase::Pending | RequestPhase::Disposed => {
                Err(PoolError::RequestDisposed(self.state.id))
            }
        }
    }

    /// Wait until a core is assigned and take ownership of it.
    ///
    /// The caller becomes responsible for disposing the returned core.
    ///
    /// # Errors
    ///
    /// As [`Self::wait_until_fulfilled`], plus [`PoolError::NoCoreAssigned`]
    /// if the core has already been taken.
    pub async fn wait_for_core(&self, cancel: &CancellationToken) -> Result<C, PoolError> {
        self.wait_until_fulfilled(cancel).await?;
        self.take_core()
            .ok_or(PoolError::NoCoreAssigned(self.state.id))
    }

    /// Take the assigned core if it is still held by the request.
    #[must_use]
    pub fn take_core(&self) -> Option<C> {
        self.state.take_core()
    }

    /// Borrow the assigned core without taking it.
    ///
    /// Do not hold the guard across an `.await`.
    #[must_use]
    pub fn core(&self) -> Option<MappedMutexGuard<'_, C>> {
        MutexGuard::try_map(self.state.slot.lock(), |slot| slot.core.as_mut()).ok()
    }

    /// Remove the request from its registry and dispose any untaken core.
    pub async fn dispose(mut self) {
        if let Some(core) = self.collection.remove_request(&self.state).await {
            core.dispose().await;
        }
        self.disposed = true;
    }
}

impl<C: WorkerCore> std::fmt::Debug for WorkerCoreRequest<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCoreRequest")
            .field("id", &self.state.id)
            .field("preference", &self.state.preference)
            .field("fulfilled", &self.state.is_assigned())
            .finish_non_exhaustive()
    }
}

impl<C: WorkerCore> Drop for WorkerCoreRequest<C> {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        let collection = Arc::clone(&self.collection);
        let state = Arc::clone(&self.state);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Some(core) = collection.remove_request(&state).await {
                    core.dispose().await;
                }
            });
        } else {
            warn!(
                request_id = %state.id,
                "request dropped outside a tokio runtime, registry cleanup skipped"
            );
        }
    }
}
