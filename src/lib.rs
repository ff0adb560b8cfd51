//! # Prometheus Core Pool
//!
//! The worker core allocation engine of the Prometheus distributed build
//! dispatcher.
//!
//! Build jobs need somewhere to run. Each unit of execution capacity, a
//! *worker core*, comes either from this machine or from a remote agent, and
//! remote agents connect and disconnect while the dispatcher is running. This
//! crate matches pending "I need one core" requests against that changing set
//! of providers, honouring locality preferences and cancellation.
//!
//! ## Core Problem Solved
//!
//! - **Locality**: some jobs must run locally, some would rather run locally,
//!   some would rather run remotely
//! - **Slow, unreliable providers**: a remote agent may take seconds to answer,
//!   fail, or hand out a core whose executor has already gone away
//! - **Churn**: providers join and leave at any time; in-flight work against a
//!   departed provider must be cancelled and cleaned up
//! - **Over-provisioning without over-committing**: ask a few more providers
//!   than strictly needed so the fastest answers win, then give the rest back
//!
//! ## Key Components
//!
//! - **`WorkerCoreRequestCollection`**: registry of outstanding requests with
//!   statistics and change notifications
//! - **`WorkerCoreProviderCollection`**: registry of remote providers
//! - **`SingleSourceWorkerCoreRequestFulfiller`**: serves requests from one
//!   dedicated provider
//! - **`MultipleSourceWorkerCoreRequestFulfiller`**: serves requests from many
//!   providers, keeping `pending + 3` obtainment attempts in flight
//! - **`WorkerPool`**: wires a registry to a local and a remote fulfiller
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_core_pool::builders::WorkerPoolBuilder;
//! use prometheus_core_pool::config::WorkerPoolConfig;
//! use prometheus_core_pool::core::CoreAllocationPreference;
//! use prometheus_core_pool::infra::SemaphoreCoreProvider;
//! use tokio_util::sync::CancellationToken;
//!
//! let pool = WorkerPoolBuilder::new(WorkerPoolConfig::new())
//!     .with_local_provider(Arc::new(SemaphoreCoreProvider::local()))
//!     .build()?;
//!
//! let request = pool
//!     .reserve_core(CoreAllocationPreference::RequireLocal, &CancellationToken::new())
//!     .await?;
//! // ... run the job ...
//! request.dispose().await;
//! ```
//!
//! For complete examples, see:
//! - `tests/multiple_source_test.rs` - Multi-provider fulfilment scenarios
//! - `tests/worker_pool_test.rs` - End-to-end pool usage

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Requests, providers, fulfillers and tracing.
pub mod core;
/// Configuration models for fulfillers and pools.
pub mod config;
/// Builders to construct worker pools from configuration.
pub mod builders;
/// Concrete core providers.
pub mod infra;
/// Shared utilities.
pub mod util;
