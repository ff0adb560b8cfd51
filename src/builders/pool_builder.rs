//! Worker pool facade and its builder.
//!
//! A [`WorkerPool`] wires one request registry to up to two fulfillers:
//!
//! - a local [`SingleSourceWorkerCoreRequestFulfiller`] over a dedicated
//!   provider (usually this machine), serving requests that require or prefer
//!   local execution;
//! - a remote [`MultipleSourceWorkerCoreRequestFulfiller`] over a provider
//!   collection that remote agents join and leave at runtime.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_core_pool::builders::WorkerPoolBuilder;
//! use prometheus_core_pool::config::WorkerPoolConfig;
//! use prometheus_core_pool::core::CoreAllocationPreference;
//! use prometheus_core_pool::infra::SemaphoreCoreProvider;
//! use tokio_util::sync::CancellationToken;
//!
//! let pool = WorkerPoolBuilder::new(WorkerPoolConfig::new().with_remote_enabled(true))
//!     .with_local_provider(Arc::new(SemaphoreCoreProvider::local()))
//!     .build()?;
//!
//! let request = pool
//!     .reserve_core(CoreAllocationPreference::PreferLocal, &CancellationToken::new())
//!     .await?;
//! // ... run work on the core ...
//! request.dispose().await;
//! pool.shutdown().await;
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::WorkerPoolConfig;
use crate::core::{
    CoreAllocationPreference, MultipleSourceWorkerCoreRequestFulfiller, PoolError,
    ProviderObtainmentSnapshot, RequestStatistics, SharedProvider,
    SingleSourceWorkerCoreRequestFulfiller, WorkerCore, WorkerCoreProviderCollection,
    WorkerCoreRequest, WorkerCoreRequestCollection, WorkerPoolTracer,
};

/// Request registry plus its local and remote fulfillers.
pub struct WorkerPool<C: WorkerCore> {
    requests: Arc<WorkerCoreRequestCollection<C>>,
    remote_providers: Arc<WorkerCoreProviderCollection<C>>,
    local: Option<SingleSourceWorkerCoreRequestFulfiller<C>>,
    remote: Option<MultipleSourceWorkerCoreRequestFulfiller<C>>,
}

impl<C: WorkerCore> WorkerPool<C> {
    /// Start building a pool from `config`.
    #[must_use]
    pub fn builder(config: WorkerPoolConfig) -> WorkerPoolBuilder<C> {
        WorkerPoolBuilder::new(config)
    }

    /// Reserve one core, waiting until a fulfiller provides it.
    ///
    /// # Errors
    ///
    /// [`PoolError::Cancelled`] if `cancel` fires first; the request is
    /// disposed before returning.
    pub async fn reserve_core(
        &self,
        preference: CoreAllocationPreference,
        cancel: &CancellationToken,
    ) -> Result<WorkerCoreRequest<C>, PoolError> {
        self.requests
            .create_fulfilled_request(preference, cancel)
            .await
    }

    /// The request registry.
    #[must_use]
    pub const fn requests(&self) -> &Arc<WorkerCoreRequestCollection<C>> {
        &self.requests
    }

    /// The remote provider collection.
    #[must_use]
    pub const fn remote_providers(&self) -> &Arc<WorkerCoreProviderCollection<C>> {
        &self.remote_providers
    }

    /// Register a remote provider. Returns `false` if its id is taken.
    pub fn add_remote_provider(&self, provider: SharedProvider<C>) -> bool {
        self.remote_providers.add(provider)
    }

    /// Unregister a remote provider, e.g. when its agent disconnects.
    pub fn remove_remote_provider(&self, id: &str) -> bool {
        self.remote_providers.remove(id)
    }

    /// Current request statistics.
    pub async fn statistics(&self) -> RequestStatistics {
        self.requests.get_current_statistics().await
    }

    /// Obtainment states of the remote fulfiller; empty when disabled.
    pub async fn remote_provider_states(&self) -> Vec<ProviderObtainmentSnapshot> {
        match &self.remote {
            Some(remote) => remote.provider_states().await,
            None => Vec::new(),
        }
    }

    /// Whether a local fulfiller is running.
    #[must_use]
    pub const fn has_local_fulfiller(&self) -> bool {
        self.local.is_some()
    }

    /// Whether a remote fulfiller is running.
    #[must_use]
    pub const fn has_remote_fulfiller(&self) -> bool {
        self.remote.is_some()
    }

    /// Attach or detach a diagnostic tracer on every component.
    pub fn set_tracer(&self, tracer: Option<Arc<dyn WorkerPoolTracer>>) {
        self.requests.set_tracer(tracer.clone());
        self.remote_providers.set_tracer(tracer.clone());
        if let Some(local) = &self.local {
            local.set_tracer(tracer.clone());
        }
        if let Some(remote) = &self.remote {
            remote.set_tracer(tracer);
        }
    }

    /// Shut down the local fulfiller, then the remote one.
    pub async fn shutdown(self) {
        info!("Shutting down worker pool");
        if let Some(local) = self.local {
            local.shutdown().await;
        }
        if let Some(remote) = self.remote {
            remote.shutdown().await;
        }
        info!("Worker pool shut down complete");
    }
}

/// Builder for [`WorkerPool`].
pub struct WorkerPoolBuilder<C: WorkerCore> {
    config: WorkerPoolConfig,
    local_provider: Option<SharedProvider<C>>,
    remote_providers: Option<Arc<WorkerCoreProviderCollection<C>>>,
    requests: Option<Arc<WorkerCoreRequestCollection<C>>>,
    tracer: Option<Arc<dyn WorkerPoolTracer>>,
}

impl<C: WorkerCore> WorkerPoolBuilder<C> {
    /// Builder with no providers attached.
    #[must_use]
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            local_provider: None,
            remote_providers: None,
            requests: None,
            tracer: None,
        }
    }

    /// Serve local requests from `provider`.
    #[must_use]
    pub fn with_local_provider(mut self, provider: SharedProvider<C>) -> Self {
        self.local_provider = Some(provider);
        self
    }

    /// Use an existing remote provider collection instead of a fresh one.
    #[must_use]
    pub fn with_remote_providers(mut self, providers: Arc<WorkerCoreProviderCollection<C>>) -> Self {
        self.remote_providers = Some(providers);
        self
    }

    /// Use an existing request registry instead of a fresh one.
    #[must_use]
    pub fn with_requests(mut self, requests: Arc<WorkerCoreRequestCollection<C>>) -> Self {
        self.requests = Some(requests);
        self
    }

    /// Attach a diagnostic tracer to every component.
    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn WorkerPoolTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Validate the configuration and start the fulfillers.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] if the configuration is invalid or the
    /// pool would have no way to fulfil requests.
    pub fn build(self) -> Result<WorkerPool<C>, PoolError> {
        self.config.validate().map_err(PoolError::InvalidConfig)?;
        if self.local_provider.is_none() && !self.config.enable_remote {
            return Err(PoolError::InvalidConfig(
                "pool needs a local provider or remote fulfilment".into(),
            ));
        }

        let requests = self
            .requests
            .unwrap_or_else(|| Arc::new(WorkerCoreRequestCollection::new()));
        let remote_providers = self
            .remote_providers
            .unwrap_or_else(|| Arc::new(WorkerCoreProviderCollection::new()));

        let local = self
            .local_provider
            .map(|provider| {
                SingleSourceWorkerCoreRequestFulfiller::new(
                    Arc::clone(&requests),
                    provider,
                    self.config.local.clone(),
                )
            })
            .transpose()?;

        let remote = if self.config.enable_remote {
            Some(MultipleSourceWorkerCoreRequestFulfiller::new(
                Arc::clone(&requests),
                Arc::clone(&remote_providers),
                self.config.remote.clone(),
            )?)
        } else {
            None
        };

        info!(
            local = local.is_some(),
            remote = remote.is_some(),
            "Worker pool created"
        );

        let pool = WorkerPool {
            requests,
            remote_providers,
            local,
            remote,
        };
        if let Some(tracer) = self.tracer {
            pool.set_tracer(Some(tracer));
        }
        Ok(pool)
    }
}
