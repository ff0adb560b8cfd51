//! Provider with a fixed number of slots.
//!
//! Each [`SlotCore`] holds one permit of a `tokio::sync::Semaphore`;
//! disposing the core returns the permit. Requests wait while every slot is
//! taken. Closing the provider fails pending and future requests, and cores
//! already handed out start reporting themselves as dead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::core::error::AppResult;
use crate::core::worker_core::{WorkerCore, WorkerCoreLiveness, WorkerCoreProvider};

/// Identifier used by [`SemaphoreCoreProvider::local`].
pub const LOCAL_PROVIDER_ID: &str = "local";

/// One slot of a [`SemaphoreCoreProvider`].
#[derive(Debug)]
pub struct SlotCore {
    provider_id: Arc<str>,
    number: u64,
    slots: Arc<Semaphore>,
    _permit: OwnedSemaphorePermit,
}

impl SlotCore {
    /// Id of the provider that issued this core.
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Sequence number, unique per provider.
    #[must_use]
    pub const fn number(&self) -> u64 {
        self.number
    }
}

#[async_trait]
impl WorkerCore for SlotCore {
    async fn dispose(self) {
        trace!(provider_id = %self.provider_id, core = self.number, "slot released");
    }

    fn liveness(&self) -> Option<&dyn WorkerCoreLiveness> {
        Some(self)
    }
}

#[async_trait]
impl WorkerCoreLiveness for SlotCore {
    async fn is_alive(&self, _cancel: &CancellationToken) -> bool {
        !self.slots.is_closed()
    }
}

/// Capacity-limited provider backed by a semaphore.
#[derive(Debug)]
pub struct SemaphoreCoreProvider {
    id: Arc<str>,
    slots: Arc<Semaphore>,
    total_slots: usize,
    issued: AtomicU64,
}

impl SemaphoreCoreProvider {
    /// Provider `id` with `slots` concurrent cores.
    #[must_use]
    pub fn new(id: impl Into<String>, slots: usize) -> Self {
        let id: String = id.into();
        Self {
            id: id.into(),
            slots: Arc::new(Semaphore::new(slots)),
            total_slots: slots,
            issued: AtomicU64::new(0),
        }
    }

    /// Provider for this machine with one slot per logical CPU.
    #[must_use]
    pub fn local() -> Self {
        Self::new(LOCAL_PROVIDER_ID, num_cpus::get())
    }

    /// Configured slot count.
    #[must_use]
    pub const fn total_slots(&self) -> usize {
        self.total_slots
    }

    /// Slots not currently held by a core.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Number of cores issued so far.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Stop issuing cores and mark outstanding ones dead.
    pub fn close(&self) {
        self.slots.close();
    }

    /// Whether [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }
}

#[async_trait]
impl WorkerCoreProvider<SlotCore> for SemaphoreCoreProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn request_core(&self, cancel: CancellationToken) -> AppResult<SlotCore> {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(anyhow!("core request to {} cancelled", self.id)),
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| anyhow!("provider {} is closed", self.id))?
            }
        };
        let number = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(provider_id = %self.id, core = number, "slot acquired");
        Ok(SlotCore {
            provider_id: Arc::clone(&self.id),
            number,
            slots: Arc::clone(&self.slots),
            _permit: permit,
        })
    }
}
