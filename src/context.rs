//! Contexts handed to atom read and write functions.

use std::marker::PhantomData;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};

use crate::atom::{Atom, AtomDef, AtomRef, AtomValue, Writable};
use crate::node::{Finalizer, Lifetime, NodeKey, Value};
use crate::registry::{downcast, Registry, SubscribeOptions};
use crate::result::{AsyncResult, Cause};
use crate::tracer::InvalidationReason;

/// Options for [`Context::stream`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// Only yield values produced after the stream was created.
    pub without_initial_value: bool,
}

/// Untyped part of a read context, shared by the typed wrapper and by the
/// read decorators installed through [`AtomRef`] modifiers.
#[derive(Clone)]
pub(crate) struct ContextCore {
    pub(crate) registry: Registry,
    pub(crate) key: NodeKey,
    pub(crate) lifetime: Arc<Lifetime>,
}

impl ContextCore {
    pub(crate) fn is_disposed(&self) -> bool {
        self.lifetime.is_disposed()
    }

    pub(crate) fn get_value(&self, def: &Arc<AtomDef>) -> Value {
        if self.is_disposed() {
            return self.registry.get_erased(def);
        }
        self.registry.get_tracked(&self.key, def)
    }

    pub(crate) fn add_finalizer(&self, finalizer: Finalizer) {
        if self.is_disposed() {
            finalizer();
        } else {
            self.registry.add_finalizer(&self.key, &self.lifetime, finalizer);
        }
    }

    pub(crate) fn track_reactivity(&self, keys: &Arc<[Arc<str>]>) {
        if self.is_disposed() {
            return;
        }
        self.registry.register_reactivity(&self.key, keys);
        let registry = self.registry.downgrade();
        let node = self.key.clone();
        let keys = keys.clone();
        self.add_finalizer(Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.unregister_reactivity(&node, &keys);
            }
        }));
    }

    /// Invalidate this node whenever `signal` changes, without depending on it.
    pub(crate) fn refresh_when_changed(&self, signal: &Arc<AtomDef>) {
        if self.is_disposed() {
            return;
        }
        self.registry.get_erased(signal);
        let registry = self.registry.downgrade();
        let node = self.key.clone();
        let subscription = self.registry.subscribe_erased(
            signal,
            Arc::new(move |_: &Value| {
                if let Some(registry) = registry.upgrade() {
                    registry.invalidate(&node, InvalidationReason::Refresh);
                }
            }),
            false,
        );
        self.add_finalizer(Box::new(move || drop(subscription)));
    }
}

/// Context passed to an atom's read function.
///
/// Atoms read through [`get`](Self::get) become dependencies of the atom being
/// computed. Once the computation is superseded (the atom was invalidated,
/// refreshed, or removed) the context is disposed: [`set_self`](Self::set_self)
/// is ignored, `get` no longer records dependencies, and new finalizers run
/// immediately.
pub struct Context<A> {
    core: ContextCore,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for Context<A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: AtomValue> Context<A> {
    pub(crate) fn from_core(core: ContextCore) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    /// Whether this computation has been superseded.
    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    /// Read `atom` and record it as a dependency.
    pub fn get<B: AtomValue>(&self, atom: &Atom<B>) -> B {
        downcast(&self.core.get_value(atom.def()), atom.def())
    }

    /// Read `atom` without recording a dependency.
    pub fn once<B: AtomValue>(&self, atom: &Atom<B>) -> B {
        self.core.registry.get(atom)
    }

    /// The value this atom held before the current computation, if any.
    pub fn self_value(&self) -> Option<A> {
        self.core
            .registry
            .peek_value(&self.core.key)
            .and_then(|value| value.downcast_ref::<A>().cloned())
    }

    /// Push a value into this atom from outside the normal read cycle.
    pub fn set_self(&self, value: A) {
        if self.is_disposed() {
            return;
        }
        self.core.registry.set_node_value(&self.core.key, Arc::new(value));
    }

    pub fn refresh_self(&self) {
        if self.is_disposed() {
            return;
        }
        self.core
            .registry
            .invalidate(&self.core.key, InvalidationReason::Refresh);
    }

    pub fn refresh(&self, atom: &impl AtomRef) {
        self.core.registry.refresh(atom);
    }

    pub fn set<B: AtomValue, W: Send + 'static>(&self, atom: &Writable<B, W>, value: W) {
        self.core.registry.set(atom, value);
    }

    /// Run `finalizer` when this computation is superseded or the atom is removed.
    pub fn add_finalizer(&self, finalizer: impl FnOnce() + Send + 'static) {
        self.core.add_finalizer(Box::new(finalizer));
    }

    /// Keep `atom` mounted for as long as this computation lives.
    pub fn mount(&self, atom: &impl AtomRef) {
        let subscription = self.core.registry.mount(atom);
        self.add_finalizer(move || drop(subscription));
    }

    /// Subscribe to `atom` for as long as this computation lives.
    pub fn subscribe<B: AtomValue>(
        &self,
        atom: &Atom<B>,
        listener: impl Fn(B) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) {
        let subscription = self.core.registry.subscribe(atom, listener, options);
        self.add_finalizer(move || drop(subscription));
    }

    /// Values of `atom` as an async sequence, ending when this computation does.
    pub fn stream<B: AtomValue>(
        &self,
        atom: &Atom<B>,
        options: StreamOptions,
    ) -> mpsc::UnboundedReceiver<B> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribe(
            atom,
            move |value| {
                let _ = sender.unbounded_send(value);
            },
            SubscribeOptions {
                immediate: !options.without_initial_value,
            },
        );
        receiver
    }

    /// Settled outcomes of a result atom; `Initial` and waiting states are skipped.
    pub fn stream_result<T: AtomValue, E: AtomValue>(
        &self,
        atom: &Atom<AsyncResult<T, E>>,
        options: StreamOptions,
    ) -> BoxStream<'static, Result<T, Cause<E>>> {
        self.stream(atom, options)
            .filter_map(|result| {
                future::ready(if result.is_waiting() {
                    None
                } else {
                    result.into_exit()
                })
            })
            .boxed()
    }

    /// Resolves with the next settled outcome of a result atom.
    ///
    /// The atom is read as a dependency, so it settling also recomputes this
    /// atom.
    pub fn result<T: AtomValue, E: AtomValue>(
        &self,
        atom: &Atom<AsyncResult<T, E>>,
    ) -> BoxFuture<'static, Result<T, Cause<E>>> {
        let current = self.get(atom);
        if !current.is_waiting() {
            if let Some(exit) = current.into_exit() {
                return future::ready(exit).boxed();
            }
        }
        let mut settled = self.stream_result(
            atom,
            StreamOptions {
                without_initial_value: true,
            },
        );
        async move {
            settled
                .next()
                .await
                .unwrap_or(Err(Cause::Interrupt))
        }
        .boxed()
    }
}

/// Context passed to a writable atom's write function.
pub struct WriteContext<A> {
    registry: Registry,
    key: NodeKey,
    _marker: PhantomData<fn() -> A>,
}

impl<A: AtomValue> WriteContext<A> {
    pub(crate) fn new(registry: Registry, key: NodeKey) -> Self {
        Self {
            registry,
            key,
            _marker: PhantomData,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn get<B: AtomValue>(&self, atom: &Atom<B>) -> B {
        self.registry.get(atom)
    }

    pub fn set<B: AtomValue, W: Send + 'static>(&self, atom: &Writable<B, W>, value: W) {
        self.registry.set(atom, value);
    }

    pub fn self_value(&self) -> Option<A> {
        self.registry
            .peek_value(&self.key)
            .and_then(|value| value.downcast_ref::<A>().cloned())
    }

    pub fn set_self(&self, value: A) {
        self.registry.set_node_value(&self.key, Arc::new(value));
    }

    pub fn refresh_self(&self) {
        self.registry.invalidate(&self.key, InvalidationReason::Refresh);
    }
}
