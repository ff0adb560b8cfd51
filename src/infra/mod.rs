//! Infrastructure adapters: concrete core providers.

pub mod provider;

pub use provider::{SemaphoreCoreProvider, SlotCore};
