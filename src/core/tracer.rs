//! Opt-in diagnostic tracing of allocation decisions.
//!
//! A [`WorkerPoolTracer`] receives short, labelled lines describing what the
//! registries and fulfillers are doing. It is separate from `tracing`
//! logging: tests attach a [`ConcurrentWorkerPoolTracer`] and dump its
//! history when an assertion fails, and embedders can forward lines wherever
//! they like. Components work without a tracer attached.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::util::clock::now_ms;

/// Sink for diagnostic lines.
pub trait WorkerPoolTracer: Send + Sync {
    /// Record one line from `source`.
    fn add_tracing_message(&self, source: &str, message: &str);
}

/// One recorded diagnostic line.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    /// Milliseconds since the tracer was created.
    pub elapsed_ms: u128,
    /// Wall-clock timestamp in milliseconds.
    pub created_at_ms: u128,
    /// Component that produced the line.
    pub source: String,
    /// The line itself.
    pub message: String,
}

/// Default number of lines retained by [`ConcurrentWorkerPoolTracer`].
pub const DEFAULT_MAX_TRACE_MESSAGES: usize = 10_000;

/// Thread-safe in-memory tracer with a bounded buffer.
pub struct ConcurrentWorkerPoolTracer {
    started: Instant,
    entries: Mutex<VecDeque<TraceEntry>>,
    max_messages: usize,
}

impl ConcurrentWorkerPoolTracer {
    /// Create a tracer retaining at most `max_messages` lines.
    #[must_use]
    pub fn new(max_messages: usize) -> Self {
        Self {
            started: Instant::now(),
            entries: Mutex::new(VecDeque::with_capacity(max_messages.min(1024))),
            max_messages: max_messages.max(1),
        }
    }

    /// Snapshot of the retained entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Retained entries formatted as `[+elapsed ms] source: message`.
    #[must_use]
    pub fn dump_all_messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|entry| format!("[+{}ms] {}: {}", entry.elapsed_ms, entry.source, entry.message))
            .collect()
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ConcurrentWorkerPoolTracer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRACE_MESSAGES)
    }
}

impl WorkerPoolTracer for ConcurrentWorkerPoolTracer {
    fn add_tracing_message(&self, source: &str, message: &str) {
        let entry = TraceEntry {
            elapsed_ms: self.started.elapsed().as_millis(),
            created_at_ms: now_ms(),
            source: source.to_owned(),
            message: message.to_owned(),
        };
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_messages {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// Tracer that forwards every line to `tracing` at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingWorkerPoolTracer;

impl WorkerPoolTracer for LoggingWorkerPoolTracer {
    fn add_tracing_message(&self, source: &str, message: &str) {
        tracing::trace!(source = source, "{message}");
    }
}

/// Replaceable tracer reference shared between a component and its tasks.
#[derive(Clone, Default)]
pub(crate) struct TracerSlot {
    tracer: Arc<RwLock<Option<Arc<dyn WorkerPoolTracer>>>>,
}

impl TracerSlot {
    pub(crate) fn set(&self, tracer: Option<Arc<dyn WorkerPoolTracer>>) {
        *self.tracer.write() = tracer;
    }

    /// Record a line; `message` is only built when a tracer is attached.
    pub(crate) fn trace<F>(&self, source: &str, message: F)
    where
        F: FnOnce() -> String,
    {
        let tracer = self.tracer.read().clone();
        if let Some(tracer) = tracer {
            tracer.add_tracing_message(source, &message());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_messages_in_order() {
        let tracer = ConcurrentWorkerPoolTracer::default();
        tracer.add_tracing_message("requests", "created");
        tracer.add_tracing_message("fulfiller", "assigned");

        let dump = tracer.dump_all_messages();
        assert_eq!(dump.len(), 2);
        assert!(dump[0].ends_with("requests: created"));
        assert!(dump[1].ends_with("fulfiller: assigned"));
    }

    #[test]
    fn bounded_buffer_drops_oldest() {
        let tracer = ConcurrentWorkerPoolTracer::new(2);
        tracer.add_tracing_message("a", "1");
        tracer.add_tracing_message("a", "2");
        tracer.add_tracing_message("a", "3");

        let entries = tracer.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "2");
        assert_eq!(entries[1].message, "3");
    }

    #[test]
    fn slot_without_tracer_skips_formatting() {
        let slot = TracerSlot::default();
        slot.trace("test", || panic!("message built without a tracer"));
    }

    #[test]
    fn slot_forwards_to_attached_tracer() {
        let tracer = Arc::new(ConcurrentWorkerPoolTracer::default());
        let slot = TracerSlot::default();
        slot.set(Some(tracer.clone()));
        slot.trace("slot", || "hello".to_string());
        assert_eq!(tracer.len(), 1);

        slot.set(None);
        slot.trace("slot", || "ignored".to_string());
        assert_eq!(tracer.len(), 1);
    }
}
