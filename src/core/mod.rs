//! Core allocation: requests, providers, fulfillers and tracing.

pub mod error;
pub mod event;
pub mod multiple_source;
pub mod obtainment;
pub mod provider_collection;
pub mod request;
pub mod request_collection;
pub mod single_source;
pub mod tracer;
pub mod worker_core;

pub use error::{AppResult, FulfillRejected, PoolError};
pub use event::{drain_pending, ChangeEvent};
pub use multiple_source::MultipleSourceWorkerCoreRequestFulfiller;
pub use obtainment::{ObtainmentAttempt, ObtainmentState, ProviderObtainmentSnapshot};
pub use provider_collection::{ProvidersChanged, SharedProvider, WorkerCoreProviderCollection};
pub use request::{CoreAllocationPreference, CoreFulfillerConstraint, WorkerCoreRequest};
pub use request_collection::{
    RequestStatistics, RequestSummary, UnfulfilledRequest, WorkerCoreRequestCollection,
    WorkerCoreRequestCollectionLock, WorkerCoreRequestLock,
};
pub use single_source::SingleSourceWorkerCoreRequestFulfiller;
pub use tracer::{
    ConcurrentWorkerPoolTracer, LoggingWorkerPoolTracer, TraceEntry, WorkerPoolTracer,
};
pub use worker_core::{is_core_alive, WorkerCore, WorkerCoreLiveness, WorkerCoreProvider};
