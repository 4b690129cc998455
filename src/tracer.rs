//! Tracer trait for observing the atom graph.
//!
//! Every hook has an empty default body, so an implementation only overrides
//! the events it cares about. [`NoopTracer`] is the registry default.
//! [`EventCollector`] records serializable [`TraceEvent`]s for assertions,
//! and with the `tracing` feature enabled [`TracingTracer`] forwards events to
//! the `tracing` crate.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use atom_flow::{Atom, EventCollector, Registry, TraceEvent};
//!
//! let collector = Arc::new(EventCollector::new());
//! let registry = Registry::builder().tracer(collector.clone()).build();
//!
//! let count = Atom::make(1);
//! registry.get(&count);
//!
//! assert!(collector
//!     .events()
//!     .iter()
//!     .any(|event| matches!(event, TraceEvent::NodeCreated { .. })));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Unique identifier for one computation of one atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub u64);

/// An atom identified in a type-erased manner for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TracerAtomKey {
    /// The value type name (e.g. "alloc::string::String").
    pub atom_type: String,
    /// Label, serializable key, or numeric id of the atom.
    pub key_debug: String,
}

impl TracerAtomKey {
    #[inline]
    pub fn new(atom_type: impl Into<String>, key_debug: impl Into<String>) -> Self {
        Self {
            atom_type: atom_type.into(),
            key_debug: key_debug.into(),
        }
    }
}

impl fmt::Display for TracerAtomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.key_debug, self.atom_type)
    }
}

/// Outcome of computing an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputeResult {
    /// The read produced a new value and dependents were invalidated.
    Changed,
    /// The read produced an equal value; dependents were left alone.
    Unchanged,
}

/// Why an atom was invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// A dependency produced a new value.
    DependencyChanged { dependency: TracerAtomKey },
    /// `refresh` was called or a reactivity key fired.
    Refresh,
}

/// Hooks called by the registry as the graph evolves.
///
/// Implementations must be `Send + Sync`: the registry may be shared across
/// threads.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new unique span ID. Called at the start of each computation.
    fn new_span_id(&self) -> SpanId;

    #[inline]
    fn on_node_created(&self, _atom: TracerAtomKey) {}

    #[inline]
    fn on_node_removed(&self, _atom: TracerAtomKey) {}

    #[inline]
    fn on_compute_start(&self, _span_id: SpanId, _atom: TracerAtomKey) {}

    #[inline]
    fn on_compute_end(&self, _span_id: SpanId, _atom: TracerAtomKey, _result: ComputeResult) {}

    /// Called when an atom's value is replaced, whether by computation or by a write.
    #[inline]
    fn on_value_changed(&self, _atom: TracerAtomKey) {}

    #[inline]
    fn on_invalidated(&self, _atom: TracerAtomKey, _reason: InvalidationReason) {}

    /// Called before the listeners of an atom run.
    #[inline]
    fn on_notify(&self, _atom: TracerAtomKey, _listeners: usize) {}

    /// Called when the outermost batch commits.
    #[inline]
    fn on_batch_commit(&self, _rebuilt: usize, _notified: usize) {}

    #[inline]
    fn on_cycle_detected(&self, _path: Vec<String>) {}

    /// Called when an unobserved atom is parked until its idle TTL expires.
    #[inline]
    fn on_idle_timeout_scheduled(&self, _atom: TracerAtomKey, _ttl: Duration) {}

    /// Called when a snapshot entry could not be encoded or decoded.
    #[inline]
    fn on_hydration_error(&self, _key: &str, _message: &str) {}
}

/// Tracer that discards all events.
pub struct NoopTracer;

static NOOP_SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        SpanId(NOOP_SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A recorded tracer event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TraceEvent {
    NodeCreated {
        atom: TracerAtomKey,
    },
    NodeRemoved {
        atom: TracerAtomKey,
    },
    ComputeStart {
        span_id: SpanId,
        atom: TracerAtomKey,
    },
    ComputeEnd {
        span_id: SpanId,
        atom: TracerAtomKey,
        result: ComputeResult,
    },
    ValueChanged {
        atom: TracerAtomKey,
    },
    Invalidated {
        atom: TracerAtomKey,
        reason: InvalidationReason,
    },
    Notify {
        atom: TracerAtomKey,
        listeners: usize,
    },
    BatchCommit {
        rebuilt: usize,
        notified: usize,
    },
    CycleDetected {
        path: Vec<String>,
    },
    IdleTimeoutScheduled {
        atom: TracerAtomKey,
        ttl: Duration,
    },
    HydrationError {
        key: String,
        message: String,
    },
}

/// Tracer that accumulates events for later inspection.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Mutex<Vec<TraceEvent>>,
    spans: AtomicU64,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Take collected events, clearing the collector.
    pub fn take(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Number of computations recorded for atoms whose key matches `key_debug`.
    pub fn compute_count(&self, key_debug: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| {
                matches!(event, TraceEvent::ComputeStart { atom, .. } if atom.key_debug == key_debug)
            })
            .count()
    }

    fn push(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

impl Tracer for EventCollector {
    fn new_span_id(&self) -> SpanId {
        SpanId(self.spans.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn on_node_created(&self, atom: TracerAtomKey) {
        self.push(TraceEvent::NodeCreated { atom });
    }

    fn on_node_removed(&self, atom: TracerAtomKey) {
        self.push(TraceEvent::NodeRemoved { atom });
    }

    fn on_compute_start(&self, span_id: SpanId, atom: TracerAtomKey) {
        self.push(TraceEvent::ComputeStart { span_id, atom });
    }

    fn on_compute_end(&self, span_id: SpanId, atom: TracerAtomKey, result: ComputeResult) {
        self.push(TraceEvent::ComputeEnd {
            span_id,
            atom,
            result,
        });
    }

    fn on_value_changed(&self, atom: TracerAtomKey) {
        self.push(TraceEvent::ValueChanged { atom });
    }

    fn on_invalidated(&self, atom: TracerAtomKey, reason: InvalidationReason) {
        self.push(TraceEvent::Invalidated { atom, reason });
    }

    fn on_notify(&self, atom: TracerAtomKey, listeners: usize) {
        self.push(TraceEvent::Notify { atom, listeners });
    }

    fn on_batch_commit(&self, rebuilt: usize, notified: usize) {
        self.push(TraceEvent::BatchCommit { rebuilt, notified });
    }

    fn on_cycle_detected(&self, path: Vec<String>) {
        self.push(TraceEvent::CycleDetected { path });
    }

    fn on_idle_timeout_scheduled(&self, atom: TracerAtomKey, ttl: Duration) {
        self.push(TraceEvent::IdleTimeoutScheduled { atom, ttl });
    }

    fn on_hydration_error(&self, key: &str, message: &str) {
        self.push(TraceEvent::HydrationError {
            key: key.to_string(),
            message: message.to_string(),
        });
    }
}

/// Tracer that forwards events to the `tracing` crate.
#[cfg(feature = "tracing")]
#[derive(Debug, Default)]
pub struct TracingTracer {
    spans: AtomicU64,
}

#[cfg(feature = "tracing")]
impl TracingTracer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "tracing")]
impl Tracer for TracingTracer {
    fn new_span_id(&self) -> SpanId {
        SpanId(self.spans.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn on_node_created(&self, atom: TracerAtomKey) {
        tracing::trace!(%atom, "node created");
    }

    fn on_node_removed(&self, atom: TracerAtomKey) {
        tracing::trace!(%atom, "node removed");
    }

    fn on_compute_start(&self, span_id: SpanId, atom: TracerAtomKey) {
        tracing::debug!(span = span_id.0, %atom, "compute start");
    }

    fn on_compute_end(&self, span_id: SpanId, atom: TracerAtomKey, result: ComputeResult) {
        tracing::debug!(span = span_id.0, %atom, ?result, "compute end");
    }

    fn on_invalidated(&self, atom: TracerAtomKey, reason: InvalidationReason) {
        tracing::trace!(%atom, ?reason, "invalidated");
    }

    fn on_batch_commit(&self, rebuilt: usize, notified: usize) {
        tracing::debug!(rebuilt, notified, "batch commit");
    }

    fn on_cycle_detected(&self, path: Vec<String>) {
        tracing::error!(path = %path.join(" -> "), "dependency cycle");
    }

    fn on_idle_timeout_scheduled(&self, atom: TracerAtomKey, ttl: Duration) {
        tracing::trace!(%atom, ?ttl, "idle timeout scheduled");
    }

    fn on_hydration_error(&self, key: &str, message: &str) {
        tracing::warn!(key, message, "hydration error");
    }
}
