//! Test cores and providers shared by the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use prometheus_core_pool::core::{AppResult, WorkerCore, WorkerCoreLiveness, WorkerCoreProvider};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

// ============================================================================
// TEST CORE
// ============================================================================

/// Counters shared between a provider and the cores it issued.
#[derive(Debug, Default, Clone)]
pub struct CoreCounters {
    pub requested: Arc<AtomicUsize>,
    pub issued: Arc<AtomicUsize>,
    pub disposed: Arc<AtomicUsize>,
    /// Calls that ended by cancellation or were dropped mid-flight.
    pub cancelled: Arc<AtomicUsize>,
}

impl CoreCounters {
    pub fn requested(&self) -> usize {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Core that records its disposal and can be made to report itself dead.
#[derive(Debug)]
pub struct TestCore {
    pub provider_id: String,
    pub number: u64,
    alive: Arc<AtomicBool>,
    disposed: Arc<AtomicUsize>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl TestCore {
    /// A free-standing core not tied to any provider.
    pub fn detached(number: u64, disposed: Arc<AtomicUsize>) -> Self {
        Self {
            provider_id: "detached".into(),
            number,
            alive: Arc::new(AtomicBool::new(true)),
            disposed,
            _permit: None,
        }
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerCore for TestCore {
    async fn dispose(self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }

    fn liveness(&self) -> Option<&dyn WorkerCoreLiveness> {
        Some(self)
    }
}

#[async_trait]
impl WorkerCoreLiveness for TestCore {
    async fn is_alive(&self, _cancel: &CancellationToken) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

// ============================================================================
// TEST PROVIDERS
// ============================================================================

/// Counts a core request as cancelled if it ends without being disarmed,
/// including when the caller drops the request future.
struct AbandonGuard<'a> {
    cancelled: &'a AtomicUsize,
    armed: bool,
}

impl<'a> AbandonGuard<'a> {
    fn new(cancelled: &'a AtomicUsize) -> Self {
        Self {
            cancelled,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Provider whose cores are released one at a time by the test.
pub struct ManualCoreProvider {
    id: String,
    gate: Semaphore,
    next: AtomicU64,
    pub counters: CoreCounters,
}

impl ManualCoreProvider {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            gate: Semaphore::new(0),
            next: AtomicU64::new(0),
            counters: CoreCounters::default(),
        })
    }

    pub fn release_core(&self) {
        self.gate.add_permits(1);
    }

    pub fn release_cores(&self, count: usize) {
        self.gate.add_permits(count);
    }
}

#[async_trait]
impl WorkerCoreProvider<TestCore> for ManualCoreProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn request_core(&self, cancel: CancellationToken) -> AppResult<TestCore> {
        self.counters.requested.fetch_add(1, Ordering::SeqCst);
        let mut abandoned = AbandonGuard::new(&self.counters.cancelled);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(anyhow!("cancelled")),
            permit = self.gate.acquire() => {
                permit?.forget();
                abandoned.disarm();
                self.counters.issued.fetch_add(1, Ordering::SeqCst);
                Ok(TestCore {
                    provider_id: self.id.clone(),
                    number: self.next.fetch_add(1, Ordering::SeqCst) + 1,
                    alive: Arc::new(AtomicBool::new(true)),
                    disposed: Arc::clone(&self.counters.disposed),
                    _permit: None,
                })
            }
        }
    }
}

/// Provider with a fixed number of slots; disposing a core frees its slot.
///
/// Can be told to fail its first calls, to hand out dead cores first, and to
/// stop issuing after a number of cores.
pub struct DynamicCoreProvider {
    id: String,
    slots: Arc<Semaphore>,
    failures: AtomicUsize,
    dead_cores: AtomicUsize,
    core_limit: Option<usize>,
    next: AtomicU64,
    pub counters: CoreCounters,
}

impl DynamicCoreProvider {
    pub fn new(id: &str, slots: usize) -> Self {
        Self {
            id: id.into(),
            slots: Arc::new(Semaphore::new(slots)),
            failures: AtomicUsize::new(0),
            dead_cores: AtomicUsize::new(0),
            core_limit: None,
            next: AtomicU64::new(0),
            counters: CoreCounters::default(),
        }
    }

    /// Fail the first `count` calls.
    pub fn with_failures(self, count: usize) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }

    /// Hand out `count` dead cores before any live one.
    pub fn with_dead_cores(self, count: usize) -> Self {
        self.dead_cores.store(count, Ordering::SeqCst);
        self
    }

    /// Never issue more than `limit` cores in total.
    pub fn with_core_limit(mut self, limit: usize) -> Self {
        self.core_limit = Some(limit);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WorkerCoreProvider<TestCore> for DynamicCoreProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn request_core(&self, cancel: CancellationToken) -> AppResult<TestCore> {
        self.counters.requested.fetch_add(1, Ordering::SeqCst);
        if Self::take_one(&self.failures) {
            return Err(anyhow!("provider {} failed on purpose", self.id));
        }

        let exhausted = self
            .core_limit
            .is_some_and(|limit| self.counters.issued() >= limit);
        let acquire = async {
            if exhausted {
                std::future::pending::<()>().await;
            }
            Arc::clone(&self.slots).acquire_owned().await
        };

        let mut abandoned = AbandonGuard::new(&self.counters.cancelled);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(anyhow!("cancelled")),
            permit = acquire => {
                let permit = permit?;
                abandoned.disarm();
                self.counters.issued.fetch_add(1, Ordering::SeqCst);
                let alive = !Self::take_one(&self.dead_cores);
                Ok(TestCore {
                    provider_id: self.id.clone(),
                    number: self.next.fetch_add(1, Ordering::SeqCst) + 1,
                    alive: Arc::new(AtomicBool::new(alive)),
                    disposed: Arc::clone(&self.counters.disposed),
                    _permit: Some(permit),
                })
            }
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
