//! The provider registry.
//!
//! Holds the set of [`WorkerCoreProvider`]s a multi-source fulfiller draws
//! from. Remote agents come and go while the dispatcher runs, so membership
//! changes are published through
//! [`WorkerCoreProviderCollection::on_providers_changed`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::event::ChangeEvent;
use crate::core::tracer::{TracerSlot, WorkerPoolTracer};
use crate::core::worker_core::{WorkerCore, WorkerCoreProvider};

const TRACE_SOURCE: &str = "providers";

/// Shared handle to a provider.
pub type SharedProvider<C> = Arc<dyn WorkerCoreProvider<C>>;

/// Membership change notification.
pub struct ProvidersChanged<C: WorkerCore> {
    /// Every provider registered after the change.
    pub current: Vec<SharedProvider<C>>,
    /// The provider that was added, if any.
    pub added: Option<SharedProvider<C>>,
    /// The provider that was removed, if any.
    pub removed: Option<SharedProvider<C>>,
}

impl<C: WorkerCore> Clone for ProvidersChanged<C> {
    fn clone(&self) -> Self {
        Self {
            current: self.current.clone(),
            added: self.added.clone(),
            removed: self.removed.clone(),
        }
    }
}

impl<C: WorkerCore> fmt::Debug for ProvidersChanged<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvidersChanged")
            .field(
                "current",
                &self.current.iter().map(|p| p.id()).collect::<Vec<_>>(),
            )
            .field("added", &self.added.as_ref().map(|p| p.id()))
            .field("removed", &self.removed.as_ref().map(|p| p.id()))
            .finish()
    }
}

/// Registry of core providers, keyed by provider id.
pub struct WorkerCoreProviderCollection<C: WorkerCore> {
    providers: Mutex<Vec<SharedProvider<C>>>,
    on_providers_changed: ChangeEvent<ProvidersChanged<C>>,
    tracer: TracerSlot,
}

impl<C: WorkerCore> Default for WorkerCoreProviderCollection<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: WorkerCore> WorkerCoreProviderCollection<C> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
            on_providers_changed: ChangeEvent::default(),
            tracer: TracerSlot::default(),
        }
    }

    /// Attach or detach a diagnostic tracer.
    pub fn set_tracer(&self, tracer: Option<Arc<dyn WorkerPoolTracer>>) {
        self.tracer.set(tracer);
    }

    /// Membership change notifications.
    pub const fn on_providers_changed(&self) -> &ChangeEvent<ProvidersChanged<C>> {
        &self.on_providers_changed
    }

    /// Register `provider`. Returns `false` if its id is already present.
    pub fn add(&self, provider: SharedProvider<C>) -> bool {
        let mut providers = self.providers.lock();
        if providers.iter().any(|p| p.id() == provider.id()) {
            return false;
        }
        providers.push(Arc::clone(&provider));
        self.tracer
            .trace(TRACE_SOURCE, || format!("added provider {}", provider.id()));
        debug!(provider_id = provider.id(), "core provider added");
        self.on_providers_changed.broadcast(ProvidersChanged {
            current: providers.clone(),
            added: Some(provider),
            removed: None,
        });
        true
    }

    /// Unregister the provider with `id`. Returns `false` if it was absent.
    pub fn remove(&self, id: &str) -> bool {
        let mut providers = self.providers.lock();
        let Some(index) = providers.iter().position(|p| p.id() == id) else {
            return false;
        };
        let provider = providers.remove(index);
        self.tracer
            .trace(TRACE_SOURCE, || format!("removed provider {id}"));
        debug!(provider_id = id, "core provider removed");
        self.on_providers_changed.broadcast(ProvidersChanged {
            current: providers.clone(),
            added: None,
            removed: Some(provider),
        });
        true
    }

    /// Whether a provider with `id` is registered.
    #[must_use]
    pub fn has(&self, id: &str) -> bool {
        self.providers.lock().iter().any(|p| p.id() == id)
    }

    /// Snapshot of the registered providers in registration order.
    #[must_use]
    pub fn get_providers(&self) -> Vec<SharedProvider<C>> {
        self.providers.lock().clone()
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.lock().len()
    }

    /// Whether no providers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.lock().is_empty()
    }
}
