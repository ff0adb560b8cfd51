//! Fulfiller drawing from a changing set of interchangeable providers.
//!
//! Remote agents are slow to answer and may never answer, so the fulfiller
//! asks several of them at once and keeps whichever cores arrive first. Each
//! provider gets an [`ObtainmentState`]; the control loop runs a pass every
//! time requests change, providers change, or an obtainment attempt ends:
//!
//! 1. Reconcile obtainment states with the provider collection. Removed
//!    providers have their attempt cancelled and any held core disposed.
//! 2. Hand held cores to pending requests. Cores are probed for liveness
//!    before the request guard is taken; dead ones are disposed.
//! 3. Size: with `n` requests still pending the target is `n + slack`
//!    engaged providers, or zero when nothing is pending.
//! 4. Rebalance: start attempts on randomly chosen idle providers, or cancel
//!    randomly chosen engaged ones, until the target is met or nothing is
//!    left to start.
//!
//! Every attempt runs as its own task. Its outcome is applied under the
//! state guard even when the attempt was cancelled, so a core that arrives
//! late is disposed instead of leaking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::MultipleSourceConfig;
use crate::core::error::{FulfillRejected, PoolError};
use crate::core::event::drain_pending;
use crate::core::obtainment::{ObtainmentAttempt, ObtainmentState, ProviderObtainmentSnapshot};
use crate::core::provider_collection::{
    ProvidersChanged, SharedProvider, WorkerCoreProviderCollection,
};
use crate::core::request::CoreFulfillerConstraint;
use crate::core::request_collection::{RequestStatistics, WorkerCoreRequestCollection};
use crate::core::tracer::{TracerSlot, WorkerPoolTracer};
use crate::core::worker_core::{is_core_alive, WorkerCore};

const TRACE_SOURCE: &str = "multi-source";

type StateMap<C> = HashMap<String, ObtainmentState<C>>;
type SharedStates<C> = Arc<Mutex<StateMap<C>>>;

/// Fulfils requests from a provider collection with speculative
/// over-provisioning.
pub struct MultipleSourceWorkerCoreRequestFulfiller<C: WorkerCore> {
    states: SharedStates<C>,
    shutdown: CancellationToken,
    background: Option<JoinHandle<()>>,
    tracer: TracerSlot,
}

impl<C: WorkerCore> MultipleSourceWorkerCoreRequestFulfiller<C> {
    /// Start fulfilling `requests` from the providers in `providers`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        requests: Arc<WorkerCoreRequestCollection<C>>,
        providers: Arc<WorkerCoreProviderCollection<C>>,
        config: MultipleSourceConfig,
    ) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let constraint = if config.fulfills_local_requests {
            CoreFulfillerConstraint::All
        } else {
            CoreFulfillerConstraint::LocalPreferredAndRemote
        };
        let states: SharedStates<C> = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let tracer = TracerSlot::default();

        info!(
            providers = providers.len(),
            slack = config.obtainment_slack,
            ?constraint,
            "Starting multi-source fulfiller"
        );

        let control = MultipleSourceLoop {
            request_changes: requests.on_requests_changed().subscribe(),
            provider_changes: providers.on_providers_changed().subscribe(),
            requests,
            providers,
            states: Arc::clone(&states),
            config,
            constraint,
            attempts: JoinSet::new(),
            attempt_owners: HashMap::new(),
            shutdown: shutdown.clone(),
            tracer: tracer.clone(),
        };
        let background = tokio::spawn(control.run());

        Ok(Self {
            states,
            shutdown,
            background: Some(background),
            tracer,
        })
    }

    /// Attach or detach a diagnostic tracer.
    pub fn set_tracer(&self, tracer: Option<Arc<dyn WorkerPoolTracer>>) {
        self.tracer.set(tracer);
    }

    /// Obtainment state of every tracked provider, ordered by provider id.
    pub async fn provider_states(&self) -> Vec<ProviderObtainmentSnapshot> {
        let mut snapshots: Vec<_> = self
            .states
            .lock()
            .await
            .values()
            .map(ObtainmentState::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }

    /// Stop the control loop, cancel every attempt and wait for their
    /// cleanup. Held cores are disposed before this returns.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(background) = self.background.take() {
            if let Err(err) = background.await {
                warn!(error = %err, "multi-source control loop panicked");
            }
        }
        info!("Multi-source fulfiller shut down");
    }
}

impl<C: WorkerCore> Drop for MultipleSourceWorkerCoreRequestFulfiller<C> {
    fn drop(&mut self) {
        if self.background.is_some() {
            self.shutdown.cancel();
            debug!("multi-source fulfiller dropped without shutdown, cleanup continues in background");
        }
    }
}

enum Wake {
    Changed,
    AttemptExited(Result<(Id, ()), JoinError>),
    Stop,
}

struct MultipleSourceLoop<C: WorkerCore> {
    requests: Arc<WorkerCoreRequestCollection<C>>,
    providers: Arc<WorkerCoreProviderCollection<C>>,
    states: SharedStates<C>,
    config: MultipleSourceConfig,
    constraint: CoreFulfillerConstraint,
    request_changes: broadcast::Receiver<RequestStatistics>,
    provider_changes: broadcast::Receiver<ProvidersChanged<C>>,
    attempts: JoinSet<()>,
    attempt_owners: HashMap<Id, (SharedProvider<C>, u64)>,
    shutdown: CancellationToken,
    tracer: TracerSlot,
}

impl<C: WorkerCore> MultipleSourceLoop<C> {
    async fn run(mut self) {
        debug!("multi-source control loop started");
        while !self.shutdown.is_cancelled() {
            self.run_pass().await;

            let faulted = match self.wait_for_change().await {
                Wake::Stop => break,
                Wake::Changed => false,
                Wake::AttemptExited(joined) => self.record_attempt_exit(joined).await,
            };
            if faulted {
                self.pause(self.config.retry_delay()).await;
            }
        }
        self.release_all().await;
        debug!("multi-source control loop stopped");
    }

    async fn wait_for_change(&mut self) -> Wake {
        let wake = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Wake::Stop,
            Some(joined) = self.attempts.join_next_with_id(), if !self.attempts.is_empty() => {
                Wake::AttemptExited(joined)
            }
            changed = self.request_changes.recv() => match changed {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => Wake::Changed,
                Err(broadcast::error::RecvError::Closed) => Wake::Stop,
            },
            changed = self.provider_changes.recv() => match changed {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => Wake::Changed,
                Err(broadcast::error::RecvError::Closed) => Wake::Stop,
            },
        };

        // The next pass re-reads both registries, so queued notifications are
        // already accounted for.
        if !matches!(wake, Wake::Stop)
            && !(drain_pending(&mut self.request_changes)
                && drain_pending(&mut self.provider_changes))
        {
            return Wake::Stop;
        }
        wake
    }

    /// Returns `true` if the attempt ended abnormally.
    async fn record_attempt_exit(&mut self, joined: Result<(Id, ()), JoinError>) -> bool {
        let err = match joined {
            Ok((id, ())) => {
                self.attempt_owners.remove(&id);
                return false;
            }
            Err(err) => err,
        };
        let owner = self.attempt_owners.remove(&err.id());
        if !err.is_panic() {
            return false;
        }

        let provider_id = owner.as_ref().map_or("<unknown>", |(provider, _)| provider.id());
        error!(provider_id = provider_id, error = %err, "Obtainment attempt panicked");
        self.tracer.trace(TRACE_SOURCE, || {
            format!("attempt for provider {provider_id} panicked")
        });
        if let Some((provider, attempt)) = owner {
            let mut states = self.states.lock().await;
            if let Some(state) = states
                .get_mut(provider.id())
                .filter(|state| state.belongs_to(&provider))
            {
                state.indicate_obtainment_failed(attempt);
            }
        }
        true
    }

    async fn run_pass(&mut self) {
        let states = Arc::clone(&self.states);
        let mut states = states.lock().await;
        let mut discarded = self.sync_providers(&mut states);

        let ready = self.collect_live_cores(&mut states, &mut discarded).await;
        let (remaining, leftovers) = self.fulfill_requests(ready).await;
        for (provider_id, core) in leftovers {
            match states.get_mut(&provider_id) {
                Some(state) => {
                    if let Err(core) = state.restore_obtained_core(core) {
                        discarded.push(core);
                    }
                }
                None => discarded.push(core),
            }
        }

        self.rebalance(&mut states, remaining, &mut discarded);
        drop(states);

        for core in discarded {
            core.dispose().await;
        }
    }

    /// Track new providers and drop removed ones, returning cores to dispose.
    fn sync_providers(&self, states: &mut StateMap<C>) -> Vec<C> {
        let current = self.providers.get_providers();
        let mut discarded = Vec::new();

        // A provider re-registered under the same id is a different provider.
        states.retain(|provider_id, state| {
            if current.iter().any(|provider| state.belongs_to(provider)) {
                return true;
            }
            if let Some(core) = state.cancel_obtaining_core() {
                discarded.push(core);
            }
            debug!(provider_id = %provider_id, "provider removed or replaced, obtainment state dropped");
            self.tracer
                .trace(TRACE_SOURCE, || format!("dropped provider {provider_id}"));
            false
        });

        for provider in current {
            if !states.contains_key(provider.id()) {
                debug!(provider_id = provider.id(), "provider tracked");
                self.tracer
                    .trace(TRACE_SOURCE, || format!("tracking provider {}", provider.id()));
                states.insert(provider.id().to_owned(), ObtainmentState::new(provider));
            }
        }
        discarded
    }

    /// Take up to one live held core per pending request.
    async fn collect_live_cores(
        &self,
        states: &mut StateMap<C>,
        discarded: &mut Vec<C>,
    ) -> Vec<(String, C)> {
        let pending = self.requests.get_unfulfilled_count(self.constraint).await;
        let mut ready = Vec::new();
        if pending == 0 {
            return ready;
        }

        let holders: Vec<String> = states
            .iter()
            .filter(|(_, state)| state.has_core())
            .map(|(provider_id, _)| provider_id.clone())
            .collect();

        for provider_id in holders {
            if ready.len() >= pending {
                break;
            }
            let Some(core) = states
                .get_mut(&provider_id)
                .and_then(ObtainmentState::take_obtained_core)
            else {
                continue;
            };
            if is_core_alive(&core, &self.shutdown).await {
                ready.push((provider_id, core));
            } else {
                debug!(provider_id = %provider_id, "Held core is not alive, disposing");
                self.tracer
                    .trace(TRACE_SOURCE, || format!("dead core from {provider_id}"));
                discarded.push(core);
            }
        }
        ready
    }

    /// Assign `ready` cores to pending requests in creation order.
    ///
    /// Returns the number of requests left pending and the unused cores.
    async fn fulfill_requests(&self, ready: Vec<(String, C)>) -> (usize, Vec<(String, C)>) {
        let snapshot = self
            .requests
            .get_all_unfulfilled_requests(self.constraint)
            .await;
        let mut cores = ready.into_iter();
        let mut leftovers = Vec::new();
        let mut remaining = 0;

        for request in snapshot.requests() {
            let Some((provider_id, core)) = cores.next() else {
                remaining += 1;
                continue;
            };
            match snapshot.fulfill(request, core) {
                Ok(()) => {
                    trace!(provider_id = %provider_id, request_id = %request.id(), "request fulfilled");
                    self.tracer.trace(TRACE_SOURCE, || {
                        format!("fulfilled request {} from {provider_id}", request.id())
                    });
                }
                Err(FulfillRejected { core, reason }) => {
                    debug!(request_id = %request.id(), reason = %reason, "core rejected");
                    leftovers.push((provider_id, core));
                }
            }
        }
        drop(snapshot);

        leftovers.extend(cores);
        (remaining, leftovers)
    }

    fn rebalance(&mut self, states: &mut StateMap<C>, remaining: usize, discarded: &mut Vec<C>) {
        let target = if remaining == 0 {
            0
        } else {
            remaining + self.config.obtainment_slack
        };
        let (mut engaged, mut idle): (Vec<String>, Vec<String>) = (Vec::new(), Vec::new());
        for (provider_id, state) in states.iter() {
            if state.is_engaged() {
                engaged.push(provider_id.clone());
            } else {
                idle.push(provider_id.clone());
            }
        }

        trace!(
            remaining = remaining,
            target = target,
            engaged = engaged.len(),
            idle = idle.len(),
            "obtainment sizing"
        );

        if target > engaged.len() {
            let wanted = target - engaged.len();
            idle.shuffle(&mut rand::rng());
            for provider_id in idle.into_iter().take(wanted) {
                self.start_attempt(states, &provider_id);
            }
        } else if target < engaged.len() {
            let surplus = engaged.len() - target;
            engaged.shuffle(&mut rand::rng());
            for provider_id in engaged.into_iter().take(surplus) {
                let Some(state) = states.get_mut(&provider_id) else {
                    continue;
                };
                debug!(provider_id = %provider_id, "cancelling surplus obtainment");
                self.tracer
                    .trace(TRACE_SOURCE, || format!("cancelled obtainment on {provider_id}"));
                if let Some(core) = state.cancel_obtaining_core() {
                    discarded.push(core);
                }
            }
        }
    }

    fn start_attempt(&mut self, states: &mut StateMap<C>, provider_id: &str) {
        let Some(state) = states.get_mut(provider_id) else {
            return;
        };
        let Some(attempt) = state.start_obtaining_core(&self.shutdown) else {
            return;
        };
        let provider = Arc::clone(state.provider());
        let number = attempt.attempt;

        debug!(provider_id = provider_id, attempt = number, "starting obtainment");
        self.tracer
            .trace(TRACE_SOURCE, || format!("obtaining from {provider_id}"));

        let handle = self.attempts.spawn(obtain_core(
            Arc::clone(&self.states),
            Arc::clone(&provider),
            attempt,
            self.config.retry_delay(),
            self.tracer.clone(),
        ));
        self.attempt_owners.insert(handle.id(), (provider, number));
    }

    async fn pause(&self, delay: Duration) {
        tokio::select! {
            () = self.shutdown.cancelled() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }

    /// Cancel everything and wait for every attempt to finish its cleanup.
    async fn release_all(&mut self) {
        let held: Vec<C> = self
            .states
            .lock()
            .await
            .values_mut()
            .filter_map(ObtainmentState::cancel_obtaining_core)
            .collect();
        for core in held {
            core.dispose().await;
        }
        while let Some(joined) = self.attempts.join_next_with_id().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    error!(error = %err, "Obtainment attempt panicked during shutdown");
                }
            }
        }
        self.attempt_owners.clear();
    }
}

/// One obtainment attempt against one provider.
async fn obtain_core<C: WorkerCore>(
    states: SharedStates<C>,
    provider: SharedProvider<C>,
    attempt: ObtainmentAttempt,
    retry_delay: Duration,
    tracer: TracerSlot,
) {
    let provider_id = provider.id().to_owned();
    let outcome = tokio::select! {
        biased;
        () = attempt.cancel.cancelled() => None,
        obtained = provider.request_core(attempt.cancel.clone()) => Some(obtained),
    };

    let outcome = match outcome {
        Some(Err(err)) => {
            warn!(provider_id = %provider_id, error = %err, "Core provider failed, retrying");
            tracer.trace(TRACE_SOURCE, || format!("provider {provider_id} failed: {err:#}"));
            // Stay engaged while backing off so the provider is not asked again
            // straight away.
            tokio::select! {
                () = attempt.cancel.cancelled() => {}
                () = tokio::time::sleep(retry_delay) => {}
            }
            None
        }
        Some(Ok(core)) => Some(core),
        None => None,
    };

    let stale = {
        let mut states = states.lock().await;
        let state = states
            .get_mut(&provider_id)
            .filter(|state| state.belongs_to(&provider));
        match (outcome, state) {
            (Some(core), Some(state)) => state.accept_obtained_core(attempt.attempt, core).err(),
            (Some(core), None) => Some(core),
            (None, Some(state)) => {
                state.indicate_obtainment_failed(attempt.attempt);
                None
            }
            (None, None) => None,
        }
    };

    if let Some(core) = stale {
        debug!(provider_id = %provider_id, attempt = attempt.attempt, "late core disposed");
        tracer.trace(TRACE_SOURCE, || format!("late core from {provider_id} disposed"));
        core.dispose().await;
    } else {
        trace!(provider_id = %provider_id, attempt = attempt.attempt, "obtainment attempt finished");
    }
}
