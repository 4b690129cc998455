#![doc = include_str!("../README.md")]

mod atom;
mod computation;
mod context;
mod error;
mod family;
mod function;
mod hydration;
mod node;
mod optimistic;
mod registry;
mod result;
pub mod scheduler;
mod task;
pub mod tracer;

pub use atom::{Atom, AtomRef, AtomValue, Label, Writable};
pub use computation::Computation;
pub use context::{Context, StreamOptions, WriteContext};
pub use error::AtomError;
pub use family::{family, Family};
pub use function::{FnAtom, FnInput, FnOptions, PullChunk, PullOptions, PullSource};
pub use hydration::{
    dehydrate, hydrate, DehydrateOptions, DehydratedAtom, EncodeInitialAs, Hydration, ResultPromise,
};
pub use node::{AtomId, NodeKey};
pub use optimistic::{Optimistic, Transition};
pub use registry::{Registry, RegistryBuilder, SubscribeOptions, Subscription};
pub use result::{now_millis, AsyncResult, Cause, PreviousSuccess};
pub use scheduler::{Scheduler, Task, TaskQueue};
pub use tracer::{
    ComputeResult, EventCollector, InvalidationReason, NoopTracer, SpanId, TraceEvent, Tracer,
    TracerAtomKey,
};

#[cfg(feature = "tracing")]
pub use tracer::TracingTracer;
