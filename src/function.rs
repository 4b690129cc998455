//! Function atoms: async computations triggered by writes.
//!
//! A function atom starts out `Initial` and runs only when it is called with
//! an argument. Calling it again cancels the previous run.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::atom::{with_refresh, Atom, AtomValue, Writable};
use crate::computation::{resolve, run_effect, Computation, ResultContext};
use crate::context::{Context, WriteContext};
use crate::registry::Registry;
use crate::result::{AsyncResult, Cause};

/// Input accepted by a function atom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FnInput<Arg> {
    /// Run the function with this argument, cancelling any previous run.
    Call(Arg),
    /// Cancel any run and go back to `Initial`.
    Reset,
    /// Cancel the current run, keeping its previous success. Ignored unless
    /// a run is in flight.
    Interrupt,
}

/// A function atom from `Arg` to `AsyncResult<T, E>`.
pub type FnAtom<T, E, Arg> = Writable<AsyncResult<T, E>, FnInput<Arg>>;

/// Options for [`Atom::fn_with`].
#[derive(Debug, Clone, Default)]
pub struct FnOptions {
    /// Reactivity keys refreshed each time a call succeeds.
    pub reactivity_keys: Vec<String>,
}

#[derive(Clone, PartialEq)]
struct Invocation<Arg> {
    // Bumped on every call so repeating an argument still reruns.
    counter: u64,
    arg: Option<Arg>,
    interrupted: bool,
}

impl<Arg> Default for Invocation<Arg> {
    fn default() -> Self {
        Self {
            counter: 0,
            arg: None,
            interrupted: false,
        }
    }
}

fn function_atom<T, E, Arg>(
    run: impl Fn(Arg, &ResultContext<T, E>) -> Computation<T, E> + Send + Sync + 'static,
) -> FnAtom<T, E, Arg>
where
    T: AtomValue,
    E: AtomValue,
    Arg: AtomValue,
{
    let invocation = Atom::make(Invocation::<Arg>::default());
    let source = invocation.clone();
    Atom::writable(
        move |ctx: &ResultContext<T, E>| {
            let call = ctx.get(&source);
            if call.interrupted {
                return AsyncResult::failure_with_previous(Cause::Interrupt, ctx.self_value().as_ref());
            }
            match call.arg {
                Some(arg) => resolve(ctx, run(arg, ctx)),
                None => AsyncResult::initial(false),
            }
        },
        move |ctx: &WriteContext<AsyncResult<T, E>>, input: FnInput<Arg>| {
            let current = ctx.get(&invocation);
            let next = match input {
                FnInput::Call(arg) => Invocation {
                    counter: current.counter + 1,
                    arg: Some(arg),
                    interrupted: false,
                },
                FnInput::Reset => Invocation::default(),
                FnInput::Interrupt => {
                    if !ctx.self_value().is_some_and(|result| result.is_waiting()) {
                        return;
                    }
                    Invocation {
                        interrupted: true,
                        ..current
                    }
                }
            };
            ctx.set(&invocation, next);
        },
    )
}

impl<T: AtomValue, E: AtomValue> Atom<AsyncResult<T, E>> {
    /// A function atom running the future `f` returns for each call.
    pub fn fn_<Arg, F>(
        f: impl Fn(Arg, &Context<AsyncResult<T, E>>) -> F + Send + Sync + 'static,
    ) -> FnAtom<T, E, Arg>
    where
        Arg: AtomValue,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::fn_with(f, FnOptions::default())
    }

    pub fn fn_with<Arg, F>(
        f: impl Fn(Arg, &Context<AsyncResult<T, E>>) -> F + Send + Sync + 'static,
        options: FnOptions,
    ) -> FnAtom<T, E, Arg>
    where
        Arg: AtomValue,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let keys: Arc<[String]> = options.reactivity_keys.into();
        function_atom(move |arg, ctx: &ResultContext<T, E>| {
            let future = f(arg, ctx);
            if keys.is_empty() {
                return Computation::effect(future);
            }
            let registry = ctx.registry().downgrade();
            let keys = keys.clone();
            Computation::effect(async move {
                let exit = future.await;
                if exit.is_ok() {
                    if let Some(registry) = registry.upgrade() {
                        registry.invalidate_reactivity(keys.iter());
                    }
                }
                exit
            })
        })
    }

    /// A function atom driven by the stream `f` returns for each call.
    pub fn fn_stream<Arg, S>(
        f: impl Fn(Arg, &Context<AsyncResult<T, E>>) -> S + Send + Sync + 'static,
    ) -> FnAtom<T, E, Arg>
    where
        Arg: AtomValue,
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        function_atom(move |arg, ctx: &ResultContext<T, E>| Computation::stream(f(arg, ctx)))
    }
}

impl Registry {
    /// Call a function atom with `arg`.
    pub fn call<T: AtomValue, E: AtomValue, Arg: AtomValue>(&self, atom: &FnAtom<T, E, Arg>, arg: Arg) {
        self.set(atom, FnInput::Call(arg));
    }
}

// ============================================================================
// Pull
// ============================================================================

/// Items pulled so far from a [pull atom](Atom::pull).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullChunk<T> {
    /// The stream has ended; further pulls do nothing.
    pub done: bool,
    pub items: Vec<T>,
    #[serde(skip)]
    generation: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PullOptions {
    /// Keep only the most recent item instead of every item pulled.
    pub disable_accumulation: bool,
}

/// One instance of the stream behind a pull atom.
pub struct PullSource<T, E> {
    generation: u64,
    stream: Arc<futures::lock::Mutex<BoxStream<'static, Result<T, E>>>>,
}

impl<T, E> PullSource<T, E> {
    fn new(stream: BoxStream<'static, Result<T, E>>) -> Self {
        static GENERATION: AtomicU64 = AtomicU64::new(1);
        Self {
            generation: GENERATION.fetch_add(1, Ordering::Relaxed),
            stream: Arc::new(futures::lock::Mutex::new(stream)),
        }
    }
}

impl<T, E> Clone for PullSource<T, E> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            stream: self.stream.clone(),
        }
    }
}

impl<T, E> PartialEq for PullSource<T, E> {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation
    }
}

impl<T, E> fmt::Debug for PullSource<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullSource")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<T: AtomValue, E: AtomValue> Atom<AsyncResult<PullChunk<T>, E>> {
    /// An atom that reads `create`'s stream one item per write.
    ///
    /// The first item is pulled when the atom is first read; every
    /// `registry.set(&atom, ())` pulls the next one. Refreshing the atom
    /// recreates the stream and starts over.
    pub fn pull<S>(
        create: impl Fn(&Context<PullSource<T, E>>) -> S + Send + Sync + 'static,
        options: PullOptions,
    ) -> Writable<AsyncResult<PullChunk<T>, E>, ()>
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        let source = Atom::readable(move |ctx: &Context<PullSource<T, E>>| PullSource::new(create(ctx).boxed()));
        let signal = Atom::make(0u64);
        let (read_source, read_signal, refreshed) = (source.clone(), signal.clone(), source);

        let pull = Atom::writable(
            move |ctx: &ResultContext<PullChunk<T>, E>| {
                ctx.get(&read_signal);
                let source = ctx.get(&read_source);
                let generation = source.generation;
                let mut items = Vec::new();
                let previous = ctx.self_value().and_then(|result| result.value().cloned());
                if let Some(chunk) = previous.filter(|chunk| chunk.generation == generation) {
                    if chunk.done {
                        return AsyncResult::success(chunk);
                    }
                    if !options.disable_accumulation {
                        items = chunk.items;
                    }
                }
                let stream = source.stream;
                run_effect(
                    ctx,
                    async move {
                        let mut stream = stream.lock().await;
                        match stream.next().await {
                            Some(Ok(item)) => {
                                items.push(item);
                                Ok(PullChunk {
                                    done: false,
                                    items,
                                    generation,
                                })
                            }
                            Some(Err(error)) => Err(error),
                            None => Ok(PullChunk {
                                done: true,
                                items,
                                generation,
                            }),
                        }
                    }
                    .boxed(),
                )
            },
            move |ctx: &WriteContext<AsyncResult<PullChunk<T>, E>>, (): ()| {
                ctx.set(&signal, ctx.get(&signal) + 1);
            },
        );
        with_refresh(pull, move |registry| registry.refresh(&refreshed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskQueue;

    fn registry() -> Registry {
        Registry::builder().scheduler(Arc::new(TaskQueue::manual())).build()
    }

    #[test]
    fn function_atom_is_initial_until_called() {
        let registry = registry();
        let double = Atom::fn_(|n: i32, _| async move { Ok::<_, ()>(n * 2) });
        let _mount = registry.mount(&double);
        assert!(registry.get(&double).is_initial());

        registry.call(&double, 21);
        assert_eq!(registry.get(&double), AsyncResult::success(42));
    }

    #[test]
    fn interrupt_is_ignored_when_idle() {
        let registry = registry();
        let echo = Atom::fn_(|n: i32, _| async move { Ok::<_, ()>(n) });
        let _mount = registry.mount(&echo);
        registry.call(&echo, 1);
        registry.set(&echo, FnInput::Interrupt);
        assert_eq!(registry.get(&echo), AsyncResult::success(1));
    }

    #[test]
    fn reset_returns_to_initial() {
        let registry = registry();
        let echo = Atom::fn_(|n: i32, _| async move { Ok::<_, ()>(n) });
        let _mount = registry.mount(&echo);
        registry.call(&echo, 1);
        registry.set(&echo, FnInput::Reset);
        assert_eq!(registry.get(&echo), AsyncResult::initial(false));
    }
}
