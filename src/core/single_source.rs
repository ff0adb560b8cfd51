//! Fulfiller backed by one dedicated provider.
//!
//! Typically the local machine: every core it hands out comes from the same
//! provider, so there is nothing to balance. The control loop wakes on
//! request changes, asks the provider for a core while a request it may
//! serve is waiting, checks the core is alive and assigns it to the oldest
//! such request. Only one provider call is in flight at a time.
//!
//! Provider failures are logged and retried after `retry_delay`; the loop only
//! stops when the fulfiller is shut down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SingleSourceConfig;
use crate::core::error::{FulfillRejected, PoolError};
use crate::core::event::drain_pending;
use crate::core::provider_collection::SharedProvider;
use crate::core::request_collection::{RequestStatistics, WorkerCoreRequestCollection};
use crate::core::tracer::{TracerSlot, WorkerPoolTracer};
use crate::core::worker_core::{is_core_alive, WorkerCore};

const TRACE_SOURCE: &str = "single-source";

/// Fulfils requests from one dedicated provider.
pub struct SingleSourceWorkerCoreRequestFulfiller<C: WorkerCore> {
    provider_id: String,
    shutdown: CancellationToken,
    background: Option<JoinHandle<()>>,
    tracer: TracerSlot,
    _core: std::marker::PhantomData<fn() -> C>,
}

struct SingleSourceLoop<C: WorkerCore> {
    requests: Arc<WorkerCoreRequestCollection<C>>,
    provider: SharedProvider<C>,
    config: SingleSourceConfig,
    changes: broadcast::Receiver<RequestStatistics>,
    shutdown: CancellationToken,
    tracer: TracerSlot,
    spare: Option<C>,
}

impl<C: WorkerCore> SingleSourceWorkerCoreRequestFulfiller<C> {
    /// Start fulfilling `requests` from `provider`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        requests: Arc<WorkerCoreRequestCollection<C>>,
        provider: SharedProvider<C>,
        config: SingleSourceConfig,
    ) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let provider_id = provider.id().to_owned();
        let shutdown = CancellationToken::new();
        let tracer = TracerSlot::default();
        let control = SingleSourceLoop {
            changes: requests.on_requests_changed().subscribe(),
            requests,
            provider,
            config,
            shutdown: shutdown.clone(),
            tracer: tracer.clone(),
            spare: None,
        };

        info!(
            provider_id = %provider_id,
            fulfills_local = control.config.fulfills_local_requests,
            "Starting single-source fulfiller"
        );
        let background = tokio::spawn(control.run());

        Ok(Self {
            provider_id,
            shutdown,
            background: Some(background),
            tracer,
            _core: std::marker::PhantomData,
        })
    }

    /// Identifier of the backing provider.
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Attach or detach a diagnostic tracer.
    pub fn set_tracer(&self, tracer: Option<Arc<dyn WorkerPoolTracer>>) {
        self.tracer.set(tracer);
    }

    /// Stop the control loop and wait for it to exit.
    ///
    /// A provider call in flight is cancelled and a core kept for a later
    /// request is disposed.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(background) = self.background.take() {
            if let Err(err) = background.await {
                warn!(provider_id = %self.provider_id, error = %err, "single-source control loop panicked");
            }
        }
        info!(provider_id = %self.provider_id, "Single-source fulfiller shut down");
    }
}

impl<C: WorkerCore> Drop for SingleSourceWorkerCoreRequestFulfiller<C> {
    fn drop(&mut self) {
        if self.background.is_some() {
            self.shutdown.cancel();
            debug!(
                provider_id = %self.provider_id,
                "single-source fulfiller dropped without shutdown, control loop detached"
            );
        }
    }
}

enum Wake {
    Changed,
    Stop,
}

enum Obtained<C> {
    Core(C),
    Failed,
    NoDemand,
    Stopped,
}

impl<C: WorkerCore> SingleSourceLoop<C> {
    async fn run(mut self) {
        debug!(provider_id = self.provider.id(), "single-source control loop started");
        while !self.shutdown.is_cancelled() {
            self.fulfill_pending().await;
            if matches!(self.wait_for_change().await, Wake::Stop) {
                break;
            }
        }
        if let Some(core) = self.spare.take() {
            core.dispose().await;
        }
        debug!(provider_id = self.provider.id(), "single-source control loop stopped");
    }

    async fn wait_for_change(&mut self) -> Wake {
        let remote_delay = self.config.remote_delay();
        let recheck = async {
            match remote_delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };

        let wake = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Wake::Stop,
            changed = self.changes.recv() => match changed {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => Wake::Changed,
                Err(broadcast::error::RecvError::Closed) => Wake::Stop,
            },
            () = recheck => Wake::Changed,
        };

        // Everything queued so far is covered by the pass we are about to run.
        if matches!(wake, Wake::Changed) && !drain_pending(&mut self.changes) {
            return Wake::Stop;
        }
        wake
    }

    /// `PreferRemote` requests become eligible for a local fulfiller once they
    /// are this old. Without a configured delay they are eligible at once.
    fn offered_remote_delay(&self) -> Option<Duration> {
        Some(self.config.remote_delay().unwrap_or(Duration::ZERO))
    }

    /// Obtain cores and hand them out until no request is left.
    ///
    /// The core is obtained before a request is reserved, so requests stay
    /// visible to other fulfillers while the provider is slow to answer. A
    /// core that arrives after its request was served elsewhere is kept for
    /// the next one.
    async fn fulfill_pending(&mut self) {
        let include_local = self.config.fulfills_local_requests;
        let remote_delay = self.offered_remote_delay();

        while !self.shutdown.is_cancelled() {
            let core = match self.spare.take() {
                Some(core) => core,
                None => match self.obtain_core(include_local, remote_delay).await {
                    Obtained::Core(core) => core,
                    Obtained::Failed => continue,
                    Obtained::NoDemand | Obtained::Stopped => return,
                },
            };

            if !is_core_alive(&core, &self.shutdown).await {
                debug!(provider_id = self.provider.id(), "Obtained core is not alive, disposing");
                self.tracer.trace(TRACE_SOURCE, || "dead core disposed".to_string());
                core.dispose().await;
                continue;
            }

            let Some(lock) = self
                .requests
                .get_next_unfulfilled_request_with_remote_delay(include_local, remote_delay)
                .await
            else {
                trace!(provider_id = self.provider.id(), "no request left, keeping core");
                self.spare = Some(core);
                return;
            };
            let request_id = lock.request().id();

            match lock.fulfill(core).await {
                Ok(()) => {
                    trace!(provider_id = self.provider.id(), request_id = %request_id, "request fulfilled");
                    self.tracer
                        .trace(TRACE_SOURCE, || format!("fulfilled request {request_id}"));
                }
                Err(FulfillRejected { core, reason }) => {
                    debug!(request_id = %request_id, reason = %reason, "core rejected, keeping it");
                    self.spare = Some(core);
                }
            }
        }
    }

    /// Ask the provider for one core while a request is waiting for it.
    ///
    /// The call is abandoned if every candidate request gets served or
    /// disposed in the meantime.
    async fn obtain_core(&mut self, include_local: bool, remote_delay: Option<Duration>) -> Obtained<C> {
        if !self
            .requests
            .has_next_unfulfilled_request(include_local, remote_delay)
            .await
        {
            return Obtained::NoDemand;
        }

        let provider = Arc::clone(&self.provider);
        let cancel = self.shutdown.child_token();
        let mut call = provider.request_core(cancel.clone());
        let obtained = loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Obtained::Stopped,
                obtained = &mut call => break obtained,
                changed = self.changes.recv() => {
                    if matches!(changed, Err(broadcast::error::RecvError::Closed))
                        || !drain_pending(&mut self.changes)
                    {
                        return Obtained::Stopped;
                    }
                    if !self
                        .requests
                        .has_next_unfulfilled_request(include_local, remote_delay)
                        .await
                    {
                        cancel.cancel();
                        debug!(provider_id = provider.id(), "no request left, provider call abandoned");
                        return Obtained::NoDemand;
                    }
                }
            }
        };

        match obtained {
            Ok(core) => Obtained::Core(core),
            Err(err) => {
                warn!(
                    provider_id = provider.id(),
                    error = %err,
                    "Core provider failed, retrying"
                );
                self.tracer
                    .trace(TRACE_SOURCE, || format!("provider failed: {err:#}"));
                self.pause(self.config.retry_delay()).await;
                Obtained::Failed
            }
        }
    }

    async fn pause(&self, delay: Duration) {
        tokio::select! {
            () = self.shutdown.cancelled() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }
}
