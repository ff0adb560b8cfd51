//! The request registry.
//!
//! Every outstanding [`WorkerCoreRequest`] lives in one
//! [`WorkerCoreRequestCollection`]. The collection owns the single guard that
//! serialises creation, disposal and fulfilment, recomputes
//! [`RequestStatistics`] inside that guard on every change, and publishes the
//! new statistics through [`WorkerCoreRequestCollection::on_requests_changed`].
//!
//! Fulfillers see requests through two kinds of lock:
//!
//! - [`WorkerCoreRequestLock`]: one request, reserved for a single fulfiller
//!   while it asks its provider for a core. The registry guard is *not* held.
//! - [`WorkerCoreRequestCollectionLock`]: a snapshot of all matching
//!   unfulfilled requests with the registry guard held for as long as the lock
//!   lives. Use it for in-memory matching only.
//!
//! Requests reserved by a [`WorkerCoreRequestLock`] are invisible to the
//! snapshot, so two fulfillers never work on the same request.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::core::error::{FulfillRejected, PoolError};
use crate::core::event::ChangeEvent;
use crate::core::request::{
    CoreAllocationPreference, CoreFulfillerConstraint, RequestState, WorkerCoreRequest,
};
use crate::core::tracer::{TracerSlot, WorkerPoolTracer};
use crate::core::worker_core::WorkerCore;

const TRACE_SOURCE: &str = "requests";

/// Point-in-time request counts.
///
/// `RequireLocal` requests count as local; `PreferLocal` and `PreferRemote`
/// count as remotable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestStatistics {
    /// Pending requests that must run locally.
    pub unfulfilled_local_requests: usize,
    /// Pending requests that may run remotely.
    pub unfulfilled_remotable_requests: usize,
    /// Fulfilled requests that must run locally.
    pub fulfilled_local_requests: usize,
    /// Fulfilled requests that may run remotely.
    pub fulfilled_remotable_requests: usize,
}

impl RequestStatistics {
    /// Total number of live requests.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.unfulfilled_local_requests
            + self.unfulfilled_remotable_requests
            + self.fulfilled_local_requests
            + self.fulfilled_remotable_requests
    }

    /// Number of requests still waiting for a core.
    #[must_use]
    pub const fn unfulfilled(&self) -> usize {
        self.unfulfilled_local_requests + self.unfulfilled_remotable_requests
    }

    fn compute<C: WorkerCore>(requests: &[Arc<RequestState<C>>]) -> Self {
        let mut stats = Self::default();
        for request in requests {
            match (request.is_assigned(), request.preference.is_local()) {
                (false, true) => stats.unfulfilled_local_requests += 1,
                (false, false) => stats.unfulfilled_remotable_requests += 1,
                (true, true) => stats.fulfilled_local_requests += 1,
                (true, false) => stats.fulfilled_remotable_requests += 1,
            }
        }
        stats
    }
}

/// Read-only description of a live request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSummary {
    /// Request identifier.
    pub id: Uuid,
    /// Locality preference.
    pub preference: CoreAllocationPreference,
    /// Whether a core has been assigned.
    pub fulfilled: bool,
    /// Wall-clock creation time in milliseconds.
    pub created_at_ms: u128,
    /// Time since creation when the summary was taken.
    pub age: Duration,
}

/// A pending request as seen by a fulfiller.
pub struct UnfulfilledRequest<C: WorkerCore> {
    state: Arc<RequestState<C>>,
}

impl<C: WorkerCore> UnfulfilledRequest<C> {
    /// Request identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.state.id
    }

    /// Locality preference.
    #[must_use]
    pub fn preference(&self) -> CoreAllocationPreference {
        self.state.preference
    }

    /// Time since the request was created.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.state.created_at.elapsed()
    }
}

impl<C: WorkerCore> Clone for UnfulfilledRequest<C> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<C: WorkerCore> std::fmt::Debug for UnfulfilledRequest<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnfulfilledRequest")
            .field("id", &self.state.id)
            .field("preference", &self.state.preference)
            .finish()
    }
}

/// Registry of outstanding core requests.
pub struct WorkerCoreRequestCollection<C: WorkerCore> {
    requests: Mutex<Vec<Arc<RequestState<C>>>>,
    on_requests_changed: ChangeEvent<RequestStatistics>,
    tracer: TracerSlot,
}

impl<C: WorkerCore> Default for WorkerCoreRequestCollection<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: WorkerCore> WorkerCoreRequestCollection<C> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            on_requests_changed: ChangeEvent::default(),
            tracer: TracerSlot::default(),
        }
    }

    /// Attach or detach a diagnostic tracer.
    pub fn set_tracer(&self, tracer: Option<Arc<dyn WorkerPoolTracer>>) {
        self.tracer.set(tracer);
    }

    /// Statistics published after every add, fulfil and dispose.
    pub const fn on_requests_changed(&self) -> &ChangeEvent<RequestStatistics> {
        &self.on_requests_changed
    }

    /// Register a new pending request and return immediately.
    pub async fn create_unfulfilled_request(
        self: &Arc<Self>,
        preference: CoreAllocationPreference,
    ) -> WorkerCoreRequest<C> {
        let state = Arc::new(RequestState::new(preference));
        let mut requests = self.requests.lock().await;
        requests.push(Arc::clone(&state));
        let stats = RequestStatistics::compute(requests.as_slice());
        self.tracer.trace(TRACE_SOURCE, || {
            format!("created request {} ({preference:?})", state.id)
        });
        debug!(request_id = %state.id, ?preference, "core request created");
        self.on_requests_changed.broadcast(stats);
        drop(requests);
        WorkerCoreRequest::new(state, Arc::clone(self))
    }

    /// Register a request and wait until it has a core.
    ///
    /// If the wait ends any other way the request is disposed before the
    /// error is returned, so nothing is left behind in the registry.
    ///
    /// # Errors
    ///
    /// [`PoolError::Cancelled`] when `cancel` fires first.
    pub async fn create_fulfilled_request(
        self: &Arc<Self>,
        preference: CoreAllocationPreference,
        cancel: &CancellationToken,
    ) -> Result<WorkerCoreRequest<C>, PoolError> {
        let request = self.create_unfulfilled_request(preference).await;
        match request.wait_until_fulfilled(cancel).await {
            Ok(()) => Ok(request),
            Err(err) => {
                debug!(request_id = %request.id(), error = %err, "core request abandoned");
                request.dispose().await;
                Err(err)
            }
        }
    }

    /// Current statistics.
    pub async fn get_current_statistics(&self) -> RequestStatistics {
        RequestStatistics::compute(self.requests.lock().await.as_slice())
    }

    /// Summaries of every live request in creation order.
    pub async fn get_all_requests(&self) -> Vec<RequestSummary> {
        self.requests
            .lock()
            .await
            .iter()
            .map(|request| RequestSummary {
                id: request.id,
                preference: request.preference,
                fulfilled: request.is_assigned(),
                created_at_ms: request.created_at_ms,
                age: request.created_at.elapsed(),
            })
            .collect()
    }

    /// Number of unreserved pending requests passing `constraint`.
    pub async fn get_unfulfilled_count(&self, constraint: CoreFulfillerConstraint) -> usize {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|request| Self::is_candidate(request, constraint))
            .count()
    }

    /// Reserve the oldest pending request a fulfiller may serve.
    ///
    /// With `include_local` the candidates are requests that require or
    /// prefer a local core; without it, the remotable ones.
    pub async fn get_next_unfulfilled_request(
        self: &Arc<Self>,
        include_local: bool,
    ) -> Option<WorkerCoreRequestLock<C>> {
        self.get_next_unfulfilled_request_with_remote_delay(include_local, None)
            .await
    }

    /// As [`Self::get_next_unfulfilled_request`], additionally letting a
    /// local fulfiller take `PreferRemote` requests that have waited at least
    /// `remote_delay`. `Some(Duration::ZERO)` offers them straight away and
    /// `None` never does.
    pub async fn get_next_unfulfilled_request_with_remote_delay(
        self: &Arc<Self>,
        include_local: bool,
        remote_delay: Option<Duration>,
    ) -> Option<WorkerCoreRequestLock<C>> {
        let requests = self.requests.lock().await;
        let primary = Self::primary_constraint(include_local);
        let reserved = requests
            .iter()
            .filter(|request| Self::is_candidate(request, primary))
            .chain(
                requests
                    .iter()
                    .filter(|request| Self::is_aged_remote(request, include_local, remote_delay)),
            )
            .find(|request| request.try_acquire_lock())
            .cloned();
        drop(requests);

        reserved.map(|state| {
            self.tracer
                .trace(TRACE_SOURCE, || format!("reserved request {}", state.id));
            trace!(request_id = %state.id, "request reserved");
            WorkerCoreRequestLock {
                collection: Arc::clone(self),
                request: UnfulfilledRequest { state },
            }
        })
    }

    /// Whether [`Self::get_next_unfulfilled_request_with_remote_delay`] would
    /// find a request right now. Nothing is reserved.
    pub async fn has_next_unfulfilled_request(
        &self,
        include_local: bool,
        remote_delay: Option<Duration>,
    ) -> bool {
        let primary = Self::primary_constraint(include_local);
        self.requests.lock().await.iter().any(|request| {
            Self::is_candidate(request, primary)
                || Self::is_aged_remote(request, include_local, remote_delay)
        })
    }

    const fn primary_constraint(include_local: bool) -> CoreFulfillerConstraint {
        if include_local {
            CoreFulfillerConstraint::LocalRequiredAndPreferred
        } else {
            CoreFulfillerConstraint::LocalPreferredAndRemote
        }
    }

    /// A `PreferRemote` request old enough for a local fulfiller.
    fn is_aged_remote(
        request: &RequestState<C>,
        include_local: bool,
        remote_delay: Option<Duration>,
    ) -> bool {
        include_local
            && request.preference == CoreAllocationPreference::PreferRemote
            && remote_delay.is_some_and(|delay| request.created_at.elapsed() >= delay)
            && Self::is_candidate(request, CoreFulfillerConstraint::All)
    }

    /// Snapshot every unreserved pending request passing `constraint`.
    ///
    /// The registry guard is held until the returned lock is dropped.
    pub async fn get_all_unfulfilled_requests(
        &self,
        constraint: CoreFulfillerConstraint,
    ) -> WorkerCoreRequestCollectionLock<'_, C> {
        let guard = self.requests.lock().await;
        let requests = guard
            .iter()
            .filter(|request| Self::is_candidate(request, constraint))
            .map(|state| UnfulfilledRequest {
                state: Arc::clone(state),
            })
            .collect();
        WorkerCoreRequestCollectionLock {
            collection: self,
            guard,
            requests,
        }
    }

    fn is_candidate(request: &RequestState<C>, constraint: CoreFulfillerConstraint) -> bool {
        !request.is_assigned()
            && !request.is_lock_acquired()
            && constraint.admits(request.preference)
    }

    /// Assign `core` and publish statistics. Requires the registry guard.
    fn fulfill_within_lock(
        &self,
        requests: &[Arc<RequestState<C>>],
        state: &RequestState<C>,
        core: C,
    ) -> Result<(), FulfillRejected<C>> {
        state.assign(core)?;
        self.tracer
            .trace(TRACE_SOURCE, || format!("fulfilled request {}", state.id));
        debug!(request_id = %state.id, "core request fulfilled");
        self.on_requests_changed
            .broadcast(RequestStatistics::compute(requests));
        Ok(())
    }

    /// Remove a request and hand back any core it still owns.
    pub(crate) async fn remove_request(&self, state: &Arc<RequestState<C>>) -> Option<C> {
        let mut requests = self.requests.lock().await;
        let before = requests.len();
        requests.retain(|request| !Arc::ptr_eq(request, state));
        let core = state.mark_disposed();
        if requests.len() != before {
            let stats = RequestStatistics::compute(requests.as_slice());
            self.tracer
                .trace(TRACE_SOURCE, || format!("disposed request {}", state.id));
            debug!(request_id = %state.id, "core request disposed");
            self.on_requests_changed.broadcast(stats);
        }
        core
    }
}

/// One pending request reserved for a single fulfiller.
///
/// Dropping the lock releases the reservation.
pub struct WorkerCoreRequestLock<C: WorkerCore> {
    collection: Arc<WorkerCoreRequestCollection<C>>,
    request: UnfulfilledRequest<C>,
}

impl<C: WorkerCore> WorkerCoreRequestLock<C> {
    /// The reserved request.
    #[must_use]
    pub const fn request(&self) -> &UnfulfilledRequest<C> {
        &self.request
    }

    /// Assign `core` to the reserved request.
    ///
    /// # Errors
    ///
    /// Returns the core inside [`FulfillRejected`] if the request was
    /// disposed or fulfilled in the meantime.
    pub async fn fulfill(&self, core: C) -> Result<(), FulfillRejected<C>> {
        let requests = self.collection.requests.lock().await;
        self.collection
            .fulfill_within_lock(requests.as_slice(), &self.request.state, core)
    }
}

impl<C: WorkerCore> Drop for WorkerCoreRequestLock<C> {
    fn drop(&mut self) {
        self.request.state.release_lock();
    }
}

/// Snapshot of pending requests with the registry guard held.
pub struct WorkerCoreRequestCollectionLock<'a, C: WorkerCore> {
    collection: &'a WorkerCoreRequestCollection<C>,
    guard: MutexGuard<'a, Vec<Arc<RequestState<C>>>>,
    requests: Vec<UnfulfilledRequest<C>>,
}

impl<C: WorkerCore> WorkerCoreRequestCollectionLock<'_, C> {
    /// Pending requests in creation order.
    #[must_use]
    pub fn requests(&self) -> &[UnfulfilledRequest<C>] {
        &self.requests
    }

    /// Number of requests in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Assign `core` to `request`.
    ///
    /// # Errors
    ///
    /// Returns the core inside [`FulfillRejected`] if `request` already has a
    /// core or has been disposed.
    pub fn fulfill(&self, request: &UnfulfilledRequest<C>, core: C) -> Result<(), FulfillRejected<C>> {
        self.collection
            .fulfill_within_lock(self.guard.as_slice(), &request.state, core)
    }
}
