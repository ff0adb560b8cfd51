//! Configuration models for fulfillers and pools.

pub mod pool;

pub use pool::{
    MultipleSourceConfig, SingleSourceConfig, WorkerPoolConfig, DEFAULT_OBTAINMENT_SLACK,
    DEFAULT_RETRY_DELAY_MS,
};
