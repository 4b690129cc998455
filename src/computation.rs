//! Async-aware atoms: plain, effect-driven, and stream-driven computations.
//!
//! A computed atom's read returns a [`Computation`], a closed set of shapes
//! resolved by one `match`. Effects and streams are driven on the registry's
//! scheduler; their progress is pushed into the node with `set_self`, and the
//! previous run is aborted through a finalizer before a new one starts.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{abortable, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;

use crate::atom::{Atom, AtomValue};
use crate::context::Context;
use crate::error::AtomError;
use crate::result::{AsyncResult, Cause};
use crate::task::{catch_defects, defect_from_panic, Spawned};

/// What a computed atom's read produced.
pub enum Computation<T, E> {
    /// A value available right away.
    Ready(Result<T, E>),
    /// A single asynchronous value.
    Effect(BoxFuture<'static, Result<T, E>>),
    /// A sequence of values; each one replaces the previous.
    Stream(BoxStream<'static, Result<T, E>>),
}

impl<T, E> Computation<T, E> {
    pub fn value(value: T) -> Self {
        Computation::Ready(Ok(value))
    }

    pub fn fail(error: E) -> Self {
        Computation::Ready(Err(error))
    }

    pub fn effect(future: impl Future<Output = Result<T, E>> + Send + 'static) -> Self {
        Computation::Effect(future.boxed())
    }

    pub fn stream(stream: impl Stream<Item = Result<T, E>> + Send + 'static) -> Self {
        Computation::Stream(stream.boxed())
    }
}

impl<T, E> From<Result<T, E>> for Computation<T, E> {
    fn from(result: Result<T, E>) -> Self {
        Computation::Ready(result)
    }
}

pub(crate) type ResultContext<T, E> = Context<AsyncResult<T, E>>;

/// Resolve `computation` into the value the node should hold right now.
pub(crate) fn resolve<T: AtomValue, E: AtomValue>(
    ctx: &ResultContext<T, E>,
    computation: Computation<T, E>,
) -> AsyncResult<T, E> {
    match computation {
        Computation::Ready(Ok(value)) => AsyncResult::success(value),
        Computation::Ready(Err(error)) => {
            AsyncResult::failure_with_previous(Cause::Fail(error), ctx.self_value().as_ref())
        }
        Computation::Effect(future) => run_effect(ctx, future),
        Computation::Stream(stream) => run_stream(ctx, stream),
    }
}

/// Hands results to the read while it is still on the stack, and to
/// `set_self` once it has returned.
struct SyncSlot<T> {
    // `Some` while the read is running.
    pending: Mutex<Option<Option<T>>>,
}

impl<T> SyncSlot<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Some(None)),
        })
    }

    /// Keep `value` for the read, or give it back if the read is over.
    fn offer(&self, value: T) -> Option<T> {
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(slot) => {
                *slot = Some(value);
                None
            }
            None => Some(value),
        }
    }

    /// End the synchronous phase, returning the last value offered during it.
    fn close(&self) -> Option<T> {
        self.pending.lock().take().flatten()
    }
}

/// Push `result` to the node: into the slot during the read, or through
/// `set_self` afterwards. The slot lock is released before `set_self` runs.
fn deliver<T: AtomValue, E: AtomValue>(
    slot: &SyncSlot<AsyncResult<T, E>>,
    ctx: &ResultContext<T, E>,
    result: AsyncResult<T, E>,
) {
    if let Some(result) = slot.offer(result) {
        ctx.set_self(result);
    }
}

pub(crate) fn run_effect<T: AtomValue, E: AtomValue>(
    ctx: &ResultContext<T, E>,
    future: BoxFuture<'static, Result<T, E>>,
) -> AsyncResult<T, E> {
    let previous = ctx.self_value();
    let slot = SyncSlot::new();
    let (future, abort) = abortable(catch_defects(future));
    ctx.add_finalizer(move || abort.abort());

    let driver = {
        let slot = slot.clone();
        let ctx = ctx.clone();
        let previous = previous.clone();
        async move {
            // Aborted runs are superseded; their outcome is dropped.
            if let Ok(exit) = future.await {
                let result = AsyncResult::from_exit_with_previous(exit, previous.as_ref());
                deliver(&slot, &ctx, result);
            }
        }
    };
    Spawned::spawn(ctx.registry().scheduler().clone(), driver);

    slot.close()
        .unwrap_or_else(|| AsyncResult::waiting_from(previous))
}

pub(crate) fn run_stream<T: AtomValue, E: AtomValue>(
    ctx: &ResultContext<T, E>,
    stream: BoxStream<'static, Result<T, E>>,
) -> AsyncResult<T, E> {
    let previous = ctx.self_value();
    let slot = SyncSlot::new();
    let (stream, abort) = futures::stream::abortable(AssertUnwindSafe(stream).catch_unwind());
    ctx.add_finalizer(move || abort.abort());

    let driver = {
        let slot = slot.clone();
        let ctx = ctx.clone();
        let previous = previous.clone();
        async move {
            let mut stream = stream;
            let mut last: Option<AsyncResult<T, E>> = previous;
            let mut emitted = false;
            while let Some(item) = stream.next().await {
                let result = match item {
                    Ok(Ok(value)) => {
                        emitted = true;
                        AsyncResult::success_with(value, true)
                    }
                    Ok(Err(error)) => {
                        AsyncResult::failure_with_previous(Cause::Fail(error), last.as_ref())
                    }
                    Err(panic) => AsyncResult::failure_with_previous(defect_from_panic(panic), last.as_ref()),
                };
                let settled = result.is_failure();
                last = Some(result.clone());
                deliver(&slot, &ctx, result);
                if settled {
                    return;
                }
            }
            if stream.is_aborted() {
                return;
            }
            let done = match last {
                Some(result) if emitted => result.with_waiting(false),
                last => AsyncResult::failure_with_previous(
                    Cause::die(AtomError::EmptyStream),
                    last.as_ref(),
                ),
            };
            deliver(&slot, &ctx, done);
        }
    };
    Spawned::spawn(ctx.registry().scheduler().clone(), driver);

    slot.close()
        .unwrap_or_else(|| AsyncResult::waiting_from(previous))
}

impl<T: AtomValue, E: AtomValue> Atom<AsyncResult<T, E>> {
    /// An atom whose read returns a [`Computation`].
    ///
    /// A panic in `read` itself is captured as a defect instead of unwinding
    /// out of `get`.
    pub fn computed(
        read: impl Fn(&Context<AsyncResult<T, E>>) -> Computation<T, E> + Send + Sync + 'static,
    ) -> Self {
        Atom::readable(move |ctx| match std::panic::catch_unwind(AssertUnwindSafe(|| read(ctx))) {
            Ok(computation) => resolve(ctx, computation),
            // Misuse of the graph itself stays fatal.
            Err(panic) if panic.is::<AtomError>() => std::panic::resume_unwind(panic),
            Err(panic) => AsyncResult::failure_with_previous(
                defect_from_panic(panic),
                ctx.self_value().as_ref(),
            ),
        })
    }

    /// An atom driven by the future `read` returns.
    ///
    /// Each recomputation cancels the previous future. While the future is
    /// pending the atom shows its previous result marked as waiting.
    pub fn effect<F>(read: impl Fn(&Context<AsyncResult<T, E>>) -> F + Send + Sync + 'static) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Atom::computed(move |ctx| Computation::effect(read(ctx)))
    }

    /// An atom driven by the stream `read` returns.
    ///
    /// Every item is shown as a waiting success until the stream ends.
    pub fn stream<S>(read: impl Fn(&Context<AsyncResult<T, E>>) -> S + Send + Sync + 'static) -> Self
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        Atom::computed(move |ctx| Computation::stream(read(ctx)))
    }
}
