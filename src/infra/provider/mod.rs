//! Core provider backends.

pub mod semaphore;

pub use semaphore::{SemaphoreCoreProvider, SlotCore};
