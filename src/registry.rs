//! The registry: node table, propagation, batching, and garbage collection.
//!
//! # Locking
//!
//! All graph state sits behind one `ReentrantMutex<RefCell<Graph>>`. Public
//! operations hold the mutex for their whole duration, so a registry is
//! shared safely across threads while user callbacks (reads, writes,
//! listeners, finalizers) may re-enter it on the same thread. The `RefCell`
//! is only ever borrowed for short, callback-free sections via `with_graph`.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::atom::{Atom, AtomDef, AtomRef, AtomValue, Writable};
use crate::context::ContextCore;
use crate::error::AtomError;
use crate::node::{Finalizer, Lifetime, Listener, Node, NodeKey, NodeState, Value};
use crate::result::now_millis;
use crate::scheduler::{Scheduler, TaskQueue};
use crate::tracer::{ComputeResult, InvalidationReason, NoopTracer, Tracer, TracerAtomKey};

type RandomState = ahash::RandomState;

thread_local! {
    /// Nodes being computed on this thread, innermost last: (registry, node, name).
    static COMPUTE_STACK: RefCell<Vec<(usize, NodeKey, String)>> = const { RefCell::new(Vec::new()) };
}

/// Options for [`Registry::subscribe`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Call the listener with the current value before returning.
    pub immediate: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum BatchPhase {
    #[default]
    Disabled,
    Collect,
    Commit,
}

#[derive(Default)]
struct Batch {
    depth: usize,
    phase: BatchPhase,
    stale: Vec<NodeKey>,
    notify: IndexSet<NodeKey, RandomState>,
}

#[derive(Default)]
pub(crate) struct Graph {
    nodes: IndexMap<NodeKey, Node, RandomState>,
    batch: Batch,
    /// Idle-TTL buckets by deadline in milliseconds. May hold stale keys;
    /// `node_timeouts` is authoritative.
    timeout_buckets: BTreeMap<u64, Vec<NodeKey>>,
    node_timeouts: HashMap<NodeKey, u64, RandomState>,
    /// Hydrated values waiting for their node to be created.
    preloaded: HashMap<Arc<str>, serde_json::Value, RandomState>,
    reactivity: HashMap<Arc<str>, IndexSet<NodeKey, RandomState>, RandomState>,
    /// Nesting depth of [`Exclusive`] guards.
    operations: usize,
    /// Removal checks raised by the running operation.
    pending_removals: Vec<NodeKey>,
}

impl Graph {
    /// A lazy node nobody observes is invalidated without being recomputed.
    fn is_inactive(&self, node: &Node) -> bool {
        node.atom.lazy
            && !node.atom.keep_alive
            && node.listeners.is_empty()
            && !self.children_are_active(&node.children)
    }

    fn children_are_active(&self, children: &[NodeKey]) -> bool {
        let mut stack: Vec<&NodeKey> = children.iter().collect();
        let mut seen = HashSet::new();
        while let Some(key) = stack.pop() {
            if !seen.insert(key) {
                continue;
            }
            if let Some(child) = self.nodes.get(key) {
                if !child.atom.lazy || child.atom.keep_alive || !child.listeners.is_empty() {
                    return true;
                }
                stack.extend(child.children.iter());
            }
        }
        false
    }
}

pub(crate) struct RegistryInner {
    graph: ReentrantMutex<RefCell<Graph>>,
    scheduler: Arc<dyn Scheduler>,
    task_queue: Option<Arc<TaskQueue>>,
    tracer: Arc<dyn Tracer>,
    timeout_resolution: Duration,
    default_idle_ttl: Option<Duration>,
    initial_values: HashMap<NodeKey, Value, RandomState>,
}

/// Container owning the nodes of one reactive graph.
///
/// Cloning a `Registry` yields another handle to the same graph. Registries
/// never share nodes with each other.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Clone, Debug)]
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<Registry> {
        self.0.upgrade().map(|inner| Registry { inner })
    }
}

/// An active subscription or mount. Dropping it unsubscribes.
#[must_use = "the subscription ends as soon as it is dropped"]
#[derive(Debug)]
pub struct Subscription {
    registry: WeakRegistry,
    key: NodeKey,
    epoch: u64,
    listener: usize,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.key, self.epoch, self.listener);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Ends a batch even if the batched closure panics.
/// Holds the registry lock for the duration of one operation.
///
/// Removal checks raised while any guard is held are handed to the scheduler
/// when the outermost guard drops, so a node is never evicted by the
/// operation that created it.
pub(crate) struct Exclusive<'a> {
    registry: &'a Registry,
    _lock: ReentrantMutexGuard<'a, RefCell<Graph>>,
}

impl Drop for Exclusive<'_> {
    fn drop(&mut self) {
        let pending = self.registry.with_graph(|graph| {
            graph.operations -= 1;
            if graph.operations == 0 {
                std::mem::take(&mut graph.pending_removals)
            } else {
                Vec::new()
            }
        });
        for key in pending {
            self.registry.dispatch_removal(key);
        }
    }
}

struct BatchScope<'a>(&'a Registry);

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        self.0.end_batch();
    }
}

/// Marks a node as computing for the duration of its read.
struct ComputeFrame<'a> {
    registry: &'a Registry,
    key: &'a NodeKey,
}

impl<'a> ComputeFrame<'a> {
    fn enter(registry: &'a Registry, key: &'a NodeKey, name: String) -> Self {
        COMPUTE_STACK.with(|stack| stack.borrow_mut().push((registry.id(), key.clone(), name)));
        Self { registry, key }
    }
}

impl Drop for ComputeFrame<'_> {
    fn drop(&mut self) {
        COMPUTE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
        self.registry.with_graph(|graph| {
            if let Some(node) = graph.nodes.get_mut(self.key) {
                node.computing = false;
            }
        });
    }
}

pub(crate) fn downcast<A: AtomValue>(value: &Value, def: &AtomDef) -> A {
    match value.downcast_ref::<A>() {
        Some(value) => value.clone(),
        None => std::panic::panic_any(AtomError::TypeMismatch {
            key: def.debug_name(),
        }),
    }
}

fn tracer_key(def: &AtomDef) -> TracerAtomKey {
    TracerAtomKey::new(def.type_name, def.debug_name())
}

/// Builder for [`Registry`].
pub struct RegistryBuilder {
    scheduler: Option<Arc<dyn Scheduler>>,
    tracer: Arc<dyn Tracer>,
    timeout_resolution: Option<Duration>,
    default_idle_ttl: Option<Duration>,
    initial_values: HashMap<NodeKey, Value, RandomState>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            scheduler: None,
            tracer: Arc::new(NoopTracer),
            timeout_resolution: None,
            default_idle_ttl: None,
            initial_values: HashMap::default(),
        }
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("custom_scheduler", &self.scheduler.is_some())
            .field("timeout_resolution", &self.timeout_resolution)
            .field("default_idle_ttl", &self.default_idle_ttl)
            .field("initial_values", &self.initial_values.len())
            .finish_non_exhaustive()
    }
}

impl RegistryBuilder {
    /// Use `scheduler` for deferred work instead of a private [`TaskQueue`].
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Granularity of idle-TTL timers. Defaults to half the default idle TTL,
    /// or one second.
    pub fn timeout_resolution(mut self, resolution: Duration) -> Self {
        self.timeout_resolution = Some(resolution);
        self
    }

    /// Idle TTL for atoms that do not set their own.
    pub fn default_idle_ttl(mut self, ttl: Duration) -> Self {
        self.default_idle_ttl = Some(ttl);
        self
    }

    /// Seed `atom` with `value` whenever its node is created.
    pub fn initial_value<A: AtomValue>(mut self, atom: &Atom<A>, value: A) -> Self {
        self.initial_values.insert(atom.node_key(), Arc::new(value));
        self
    }

    pub fn build(self) -> Registry {
        let (scheduler, task_queue) = match self.scheduler {
            Some(scheduler) => (scheduler, None),
            None => {
                let queue = Arc::new(TaskQueue::new());
                (queue.clone() as Arc<dyn Scheduler>, Some(queue))
            }
        };
        let timeout_resolution = self
            .timeout_resolution
            .or(self.default_idle_ttl.map(|ttl| ttl / 2))
            .filter(|resolution| !resolution.is_zero())
            .unwrap_or(Duration::from_secs(1));
        Registry {
            inner: Arc::new(RegistryInner {
                graph: ReentrantMutex::new(RefCell::new(Graph::default())),
                scheduler,
                task_queue,
                tracer: self.tracer,
                timeout_resolution,
                default_idle_ttl: self.default_idle_ttl,
                initial_values: self.initial_values,
            }),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("nodes", &self.node_count())
            .field("timeout_resolution", &self.inner.timeout_resolution)
            .field("default_idle_ttl", &self.inner.default_idle_ttl)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// A registry with default configuration and its own [`TaskQueue`].
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Process-wide default registry, created on first use and never reset.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.inner.tracer
    }

    /// The queue this registry created for itself, if no scheduler was supplied.
    pub fn task_queue(&self) -> Option<&Arc<TaskQueue>> {
        self.inner.task_queue.as_ref()
    }

    /// Drive the registry's own task queue until idle.
    ///
    /// Returns 0 when the registry was built with an external scheduler.
    pub fn run_until_idle(&self) -> usize {
        self.inner
            .task_queue
            .as_ref()
            .map_or(0, |queue| queue.run_until_idle())
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// The current value of `atom`, computing it if absent or stale.
    pub fn get<A: AtomValue>(&self, atom: &Atom<A>) -> A {
        downcast(&self.get_erased(atom.def()), atom.def())
    }

    /// Write `value` through the atom's write function.
    pub fn set<A: AtomValue, W: Send + 'static>(&self, atom: &Writable<A, W>, value: W) {
        self.set_erased(atom.def(), Box::new(value));
    }

    pub fn update<A: AtomValue>(&self, atom: &Writable<A>, f: impl FnOnce(A) -> A) {
        let _guard = self.exclusive();
        let value = f(self.get(atom));
        self.set(atom, value);
    }

    /// Update `atom` and return a value computed alongside the new state.
    pub fn modify<A: AtomValue, R>(&self, atom: &Writable<A>, f: impl FnOnce(A) -> (R, A)) -> R {
        let _guard = self.exclusive();
        let (output, value) = f(self.get(atom));
        self.set(atom, value);
        output
    }

    /// Call `listener` with every new value of `atom`.
    pub fn subscribe<A: AtomValue>(
        &self,
        atom: &Atom<A>,
        listener: impl Fn(A) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> Subscription {
        let listener: Listener = Arc::new(move |value: &Value| {
            if let Some(value) = value.downcast_ref::<A>() {
                listener(value.clone());
            }
        });
        self.subscribe_erased(atom.def(), listener, options.immediate)
    }

    /// Keep `atom` computed and alive without observing its values.
    pub fn mount(&self, atom: &impl AtomRef) -> Subscription {
        self.subscribe_erased(atom.def(), Arc::new(|_: &Value| {}), true)
    }

    /// Recompute `atom` even though its dependencies did not change.
    ///
    /// In-flight async work of the previous computation is cancelled first.
    pub fn refresh(&self, atom: &impl AtomRef) {
        self.refresh_def(atom.def());
    }

    /// Discard the value of `atom` so it is recomputed from its definition.
    pub fn reset(&self, atom: &impl AtomRef) {
        let _guard = self.exclusive();
        let key = atom.node_key();
        let Some(def) = self.with_graph(|graph| graph.nodes.get(&key).map(|node| node.atom.clone()))
        else {
            return;
        };
        self.end_lifetime(&key);
        let inactive = self.with_graph(|graph| {
            let node = graph.nodes.get_mut(&key)?;
            node.value = None;
            node.state = NodeState::Uninitialized;
            node.skip_invalidation = false;
            let node = graph.nodes.get(&key)?;
            Some(graph.is_inactive(node))
        });
        match inactive {
            Some(true) => self.invalidate_children(&key, &def),
            Some(false) => {
                self.compute(&key);
            }
            None => {}
        }
    }

    /// Run `f` with notifications deferred until the outermost batch ends.
    ///
    /// Reads inside the batch observe writes made earlier in it. Each node is
    /// recomputed and notified at most once per batch.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.exclusive();
        self.with_graph(|graph| {
            graph.batch.depth += 1;
            graph.batch.phase = BatchPhase::Collect;
        });
        let scope = BatchScope(self);
        let output = f();
        drop(scope);
        output
    }

    /// Refresh every atom registered under any of `keys`.
    pub fn invalidate_reactivity<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let _guard = self.exclusive();
        let nodes: Vec<NodeKey> = self.with_graph(|graph| {
            let mut nodes = IndexSet::<NodeKey, RandomState>::default();
            for key in keys {
                if let Some(registered) = graph.reactivity.get(key.as_ref()) {
                    nodes.extend(registered.iter().cloned());
                }
            }
            nodes.into_iter().collect()
        });
        if nodes.is_empty() {
            return;
        }
        self.batch(|| {
            for key in &nodes {
                self.invalidate(key, InvalidationReason::Refresh);
            }
        });
    }

    pub fn contains(&self, atom: &impl AtomRef) -> bool {
        let key = atom.node_key();
        self.with_graph(|graph| graph.nodes.contains_key(&key))
    }

    pub fn node_count(&self) -> usize {
        self.with_graph(|graph| graph.nodes.len())
    }

    /// Remove every node, running each node's finalizers exactly once.
    ///
    /// The registry stays usable; atoms read afterwards start from scratch.
    pub fn dispose(&self) {
        let _guard = self.exclusive();
        let nodes = self.with_graph(|graph| {
            graph.timeout_buckets.clear();
            graph.node_timeouts.clear();
            graph.reactivity.clear();
            graph.preloaded.clear();
            std::mem::take(&mut graph.nodes)
        });
        for (_, mut node) in nodes {
            node.state = NodeState::Removed;
            self.inner.tracer.on_node_removed(tracer_key(&node.atom));
            for finalizer in node.end_lifetime().unwrap_or_default() {
                finalizer();
            }
        }
    }

    // ========================================================================
    // Crate-internal entry points
    // ========================================================================

    pub(crate) fn exclusive(&self) -> Exclusive<'_> {
        let lock = self.inner.graph.lock();
        lock.borrow_mut().operations += 1;
        Exclusive {
            registry: self,
            _lock: lock,
        }
    }

    fn with_graph<R>(&self, f: impl FnOnce(&mut Graph) -> R) -> R {
        let guard = self.inner.graph.lock();
        let mut graph = guard.borrow_mut();
        f(&mut graph)
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }

    pub(crate) fn get_erased(&self, def: &Arc<AtomDef>) -> Value {
        let _guard = self.exclusive();
        self.value_of(def)
    }

    /// Read `def` on behalf of the node `child`, recording the edge.
    pub(crate) fn get_tracked(&self, child: &NodeKey, def: &Arc<AtomDef>) -> Value {
        let _guard = self.exclusive();
        let parent = self.ensure_node(def);
        self.check_cycle(&parent);
        self.with_graph(|graph| {
            let link = graph
                .nodes
                .get_mut(child)
                .is_some_and(|node| node.add_parent(&parent));
            if link {
                if let Some(node) = graph.nodes.get_mut(&parent) {
                    if !node.children.contains(child) {
                        node.children.push(child.clone());
                    }
                }
            }
        });
        match self.compute(&parent) {
            Some(value) => value,
            None => self.value_of(def),
        }
    }

    pub(crate) fn set_erased(&self, def: &Arc<AtomDef>, value: Box<dyn Any + Send>) {
        let _guard = self.exclusive();
        let key = self.ensure_node(def);
        if let Some(write) = def.write.clone() {
            write(self, &key, value);
        }
    }

    pub(crate) fn refresh_def(&self, def: &Arc<AtomDef>) {
        let _guard = self.exclusive();
        if let Some(refresh) = def.refresh.clone() {
            refresh(self);
            return;
        }
        let key = def.key();
        if self.with_graph(|graph| graph.nodes.contains_key(&key)) {
            self.invalidate(&key, InvalidationReason::Refresh);
        }
    }

    pub(crate) fn subscribe_erased(
        &self,
        def: &Arc<AtomDef>,
        listener: Listener,
        immediate: bool,
    ) -> Subscription {
        let _guard = self.exclusive();
        // The node must have read its dependencies to hear about their changes.
        let value = self.value_of(def);
        if immediate {
            listener(&value);
        }
        let key = self.ensure_node(def);
        let slot = self.with_graph(|graph| {
            let node = graph.nodes.get_mut(&key)?;
            Some((node.epoch, node.listeners.insert(listener)))
        });
        let (epoch, listener, active) = match slot {
            Some((epoch, listener)) => (epoch, listener, true),
            None => (0, 0, false),
        };
        Subscription {
            registry: self.downgrade(),
            key,
            epoch,
            listener,
            active,
        }
    }

    fn unsubscribe(&self, key: &NodeKey, epoch: u64, listener: usize) {
        let _guard = self.exclusive();
        let removable = self.with_graph(|graph| {
            let Some(node) = graph.nodes.get_mut(key) else {
                return false;
            };
            if node.epoch != epoch {
                return false;
            }
            if node.listeners.contains(listener) {
                node.listeners.remove(listener);
            }
            node.can_be_removed()
        });
        if removable {
            self.schedule_removal(key);
        }
    }

    pub(crate) fn peek_value(&self, key: &NodeKey) -> Option<Value> {
        self.with_graph(|graph| graph.nodes.get(key).and_then(|node| node.value.clone()))
    }

    /// Attach `finalizer` to the computation owning `lifetime`, or run it now
    /// if that computation is already over.
    pub(crate) fn add_finalizer(&self, key: &NodeKey, lifetime: &Arc<Lifetime>, finalizer: Finalizer) {
        let rejected = self.with_graph(|graph| match graph.nodes.get_mut(key) {
            Some(node)
                if node
                    .lifetime
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, lifetime)) =>
            {
                node.finalizers.push(finalizer);
                None
            }
            _ => Some(finalizer),
        });
        if let Some(finalizer) = rejected {
            finalizer();
        }
    }

    pub(crate) fn register_reactivity(&self, node: &NodeKey, keys: &[Arc<str>]) {
        self.with_graph(|graph| {
            for key in keys {
                graph
                    .reactivity
                    .entry(key.clone())
                    .or_default()
                    .insert(node.clone());
            }
        });
    }

    pub(crate) fn unregister_reactivity(&self, node: &NodeKey, keys: &[Arc<str>]) {
        self.with_graph(|graph| {
            for key in keys {
                if let Some(nodes) = graph.reactivity.get_mut(key) {
                    nodes.shift_remove(node);
                    if nodes.is_empty() {
                        graph.reactivity.remove(key);
                    }
                }
            }
        });
    }

    // ========================================================================
    // Hydration support
    // ========================================================================

    /// Serializable nodes holding a value, in creation order.
    pub(crate) fn serializable_values(&self) -> Vec<(Arc<AtomDef>, Value)> {
        self.with_graph(|graph| {
            graph
                .nodes
                .values()
                .filter(|node| node.atom.codec.is_some())
                .filter_map(|node| Some((node.atom.clone(), node.value.clone()?)))
                .collect()
        })
    }

    /// The definition of the node stored under a serializable key, and the
    /// time its value last changed (`None` while uninitialized).
    pub(crate) fn serializable_node(&self, key: &str) -> Option<(Arc<AtomDef>, Option<u64>)> {
        let key = NodeKey::Key(Arc::from(key));
        self.with_graph(|graph| {
            graph.nodes.get(&key).map(|node| {
                (
                    node.atom.clone(),
                    node.is_initialized().then_some(node.updated_at),
                )
            })
        })
    }

    pub(crate) fn preload(&self, key: &str, value: serde_json::Value) {
        self.with_graph(|graph| {
            graph.preloaded.insert(Arc::from(key), value);
        });
    }

    /// Decode `value` into the node under `key`, or preload it if the node
    /// does not exist yet.
    pub(crate) fn apply_encoded(&self, key: &str, value: serde_json::Value) -> Result<(), AtomError> {
        let _guard = self.exclusive();
        match self.serializable_node(key) {
            Some((def, _)) => self.decode_into(&NodeKey::Key(Arc::from(key)), &def, value),
            None => {
                self.preload(key, value);
                Ok(())
            }
        }
    }

    fn decode_into(&self, key: &NodeKey, def: &AtomDef, value: serde_json::Value) -> Result<(), AtomError> {
        let Some(codec) = &def.codec else {
            return Ok(());
        };
        match (codec.decode)(value) {
            Ok(value) => {
                self.set_node_value(key, value);
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                self.inner.tracer.on_hydration_error(&codec.key, &message);
                Err(AtomError::Serialization {
                    key: codec.key.to_string(),
                    message,
                })
            }
        }
    }

    // ========================================================================
    // Graph algorithm
    // ========================================================================

    /// The node for `def`, created if missing. Touching a node parked in its
    /// idle window revives it.
    pub(crate) fn ensure_node(&self, def: &Arc<AtomDef>) -> NodeKey {
        enum Found {
            Existing { revived: bool },
            Created { preloaded: Option<serde_json::Value> },
        }

        let key = def.key();
        let found = self.with_graph(|graph| {
            if graph.nodes.contains_key(&key) {
                return Found::Existing {
                    revived: graph.node_timeouts.remove(&key).is_some(),
                };
            }
            graph.nodes.insert(key.clone(), Node::new(def.clone()));
            let preloaded = def
                .codec
                .as_ref()
                .and_then(|codec| graph.preloaded.remove(&codec.key));
            Found::Created { preloaded }
        });

        match found {
            Found::Existing { revived } => {
                if revived {
                    self.schedule_removal(&key);
                }
            }
            Found::Created { preloaded } => {
                self.inner.tracer.on_node_created(tracer_key(def));
                if let Some(value) = self.inner.initial_values.get(&key) {
                    self.set_node_value(&key, value.clone());
                } else if let Some(encoded) = preloaded {
                    // Errors are reported to the tracer; the atom falls back to its read.
                    let _ = self.decode_into(&key, def, encoded);
                }
                if !def.keep_alive {
                    self.schedule_removal(&key);
                }
            }
        }
        key
    }

    fn value_of(&self, def: &Arc<AtomDef>) -> Value {
        loop {
            let key = self.ensure_node(def);
            if let Some(value) = self.compute(&key) {
                return value;
            }
        }
    }

    fn check_cycle(&self, key: &NodeKey) {
        let computing = self.with_graph(|graph| graph.nodes.get(key).is_some_and(|node| node.computing));
        if !computing {
            return;
        }
        let id = self.id();
        let mut path: Vec<String> = COMPUTE_STACK.with(|stack| {
            let stack = stack.borrow();
            let start = stack
                .iter()
                .position(|(registry, node, _)| *registry == id && node == key)
                .unwrap_or(0);
            stack[start..]
                .iter()
                .filter(|(registry, _, _)| *registry == id)
                .map(|(_, _, name)| name.clone())
                .collect()
        });
        if let Some(first) = path.first().cloned() {
            path.push(first);
        }
        self.inner.tracer.on_cycle_detected(path.clone());
        std::panic::panic_any(AtomError::Cycle { path });
    }

    /// The value of the node under `key`, running its read if it is not valid.
    ///
    /// Returns `None` if there is no such node.
    fn compute(&self, key: &NodeKey) -> Option<Value> {
        enum Step {
            Cached(Value),
            Compute(Arc<AtomDef>, Arc<Lifetime>),
        }

        self.check_cycle(key);
        let step = self.with_graph(|graph| {
            let node = graph.nodes.get_mut(key)?;
            if node.state == NodeState::Valid {
                if let Some(value) = &node.value {
                    return Some(Step::Cached(value.clone()));
                }
            }
            let lifetime = Arc::new(Lifetime::default());
            node.lifetime = Some(lifetime.clone());
            node.computing = true;
            node.dependency_changed = false;
            node.waiting_for_value = true;
            Some(Step::Compute(node.atom.clone(), lifetime))
        })?;

        let (def, lifetime) = match step {
            Step::Cached(value) => return Some(value),
            Step::Compute(def, lifetime) => (def, lifetime),
        };

        let span_id = self.inner.tracer.new_span_id();
        self.inner.tracer.on_compute_start(span_id, tracer_key(&def));
        let value = {
            let _frame = ComputeFrame::enter(self, key, def.debug_name());
            (def.read)(ContextCore {
                registry: self.clone(),
                key: key.clone(),
                lifetime,
            })
        };

        let (stale_parents, waiting, rerun) = self.with_graph(|graph| match graph.nodes.get_mut(key) {
            Some(node) => (
                node.previous_parents.take().unwrap_or_default(),
                std::mem::take(&mut node.waiting_for_value),
                std::mem::take(&mut node.dependency_changed),
            ),
            None => (Vec::new(), false, false),
        });
        for parent in stale_parents {
            let removable = self.with_graph(|graph| {
                graph.nodes.get_mut(&parent).is_some_and(|node| {
                    node.remove_child(key);
                    node.can_be_removed()
                })
            });
            if removable {
                self.schedule_removal(&parent);
            }
        }

        if rerun {
            // The value was read from inputs that have since changed.
            self.inner
                .tracer
                .on_compute_end(span_id, tracer_key(&def), ComputeResult::Unchanged);
            self.end_lifetime(key);
            return self.compute(key);
        }

        let changed = waiting && self.set_node_value(key, value.clone());
        let result = if changed {
            ComputeResult::Changed
        } else {
            ComputeResult::Unchanged
        };
        self.inner.tracer.on_compute_end(span_id, tracer_key(&def), result);

        Some(self.peek_value(key).unwrap_or(value))
    }

    /// Store `value` in the node under `key`.
    ///
    /// An equal value only marks the node valid. A new value invalidates the
    /// node's dependents and notifies its listeners, or queues the
    /// notification while a batch is collecting. Returns whether the value
    /// changed.
    pub(crate) fn set_node_value(&self, key: &NodeKey, value: Value) -> bool {
        enum Outcome {
            Missing,
            Unchanged,
            Changed {
                def: Arc<AtomDef>,
                skip_invalidation: bool,
                notify_now: bool,
            },
        }

        let now = now_millis();
        let outcome = self.with_graph(|graph| {
            let collecting = graph.batch.phase == BatchPhase::Collect;
            let Some(node) = graph.nodes.get_mut(key) else {
                return Outcome::Missing;
            };
            node.waiting_for_value = false;
            if node.state != NodeState::Removed {
                node.state = NodeState::Valid;
            }
            let unchanged = node
                .value
                .as_ref()
                .is_some_and(|current| (node.atom.value_eq)(current, &value));
            if unchanged {
                node.skip_invalidation = false;
                return Outcome::Unchanged;
            }
            node.value = Some(value);
            node.updated_at = now;
            let skip_invalidation = std::mem::take(&mut node.skip_invalidation);
            let has_listeners = !node.listeners.is_empty();
            let def = node.atom.clone();
            if has_listeners && collecting {
                graph.batch.notify.insert(key.clone());
            }
            Outcome::Changed {
                def,
                skip_invalidation,
                notify_now: has_listeners && !collecting,
            }
        });

        match outcome {
            Outcome::Missing | Outcome::Unchanged => false,
            Outcome::Changed {
                def,
                skip_invalidation,
                notify_now,
            } => {
                self.inner.tracer.on_value_changed(tracer_key(&def));
                if !skip_invalidation {
                    self.invalidate_children(key, &def);
                }
                if notify_now {
                    self.notify(key);
                }
                true
            }
        }
    }

    /// Mark the node under `key` stale, cancel its current computation, and
    /// recompute it now if anything observes it.
    pub(crate) fn invalidate(&self, key: &NodeKey, reason: InvalidationReason) {
        enum Action {
            Skip,
            Deferred,
            Lazy,
            Eager,
        }

        let Some((def, was_valid)) = self.with_graph(|graph| {
            let node = graph.nodes.get_mut(key)?;
            let was_valid = node.state == NodeState::Valid;
            if was_valid {
                node.state = NodeState::Stale;
            }
            Some((node.atom.clone(), was_valid))
        }) else {
            return;
        };
        let from_dependency = matches!(reason, InvalidationReason::DependencyChanged { .. });
        self.inner.tracer.on_invalidated(tracer_key(&def), reason);
        if was_valid {
            self.end_lifetime(key);
        }

        let action = self.with_graph(|graph| {
            let Some(node) = graph.nodes.get_mut(key) else {
                return Action::Skip;
            };
            // The running read is rerun by `compute` once it returns.
            if node.computing {
                node.dependency_changed |= from_dependency;
                return Action::Skip;
            }
            if graph.batch.phase == BatchPhase::Collect {
                graph.batch.stale.push(key.clone());
                return Action::Deferred;
            }
            if graph.nodes.get(key).is_some_and(|node| graph.is_inactive(node)) {
                Action::Lazy
            } else {
                Action::Eager
            }
        });

        match action {
            Action::Lazy => {
                self.invalidate_children(key, &def);
                self.with_graph(|graph| {
                    if let Some(node) = graph.nodes.get_mut(key) {
                        node.skip_invalidation = true;
                    }
                });
            }
            Action::Eager => {
                self.compute(key);
            }
            Action::Skip | Action::Deferred => {}
        }
    }

    fn invalidate_children(&self, key: &NodeKey, source: &AtomDef) {
        let children =
            self.with_graph(|graph| graph.nodes.get(key).map(|node| node.children.clone()).unwrap_or_default());
        if children.is_empty() {
            return;
        }
        let reason = InvalidationReason::DependencyChanged {
            dependency: tracer_key(source),
        };
        for child in children {
            self.invalidate(&child, reason.clone());
        }
    }

    fn end_lifetime(&self, key: &NodeKey) {
        let finalizers = self.with_graph(|graph| graph.nodes.get_mut(key).and_then(Node::end_lifetime));
        for finalizer in finalizers.unwrap_or_default() {
            finalizer();
        }
    }

    /// Call the listeners of the node under `key` with its current value.
    fn notify(&self, key: &NodeKey) -> bool {
        let Some((def, listeners, value)) = self.with_graph(|graph| {
            let node = graph.nodes.get(key)?;
            if node.listeners.is_empty() {
                return None;
            }
            Some((node.atom.clone(), node.listener_snapshot(), node.value.clone()?))
        }) else {
            return false;
        };
        self.inner.tracer.on_notify(tracer_key(&def), listeners.len());
        for listener in listeners {
            listener(&value);
        }
        true
    }

    fn end_batch(&self) {
        let outermost = self.with_graph(|graph| {
            graph.batch.depth -= 1;
            graph.batch.depth == 0
        });
        if !outermost {
            return;
        }
        let batch = self.with_graph(|graph| std::mem::take(&mut graph.batch));
        if std::thread::panicking() {
            // Commit from the scheduler instead of running listeners while unwinding.
            let registry = self.downgrade();
            self.inner.scheduler.schedule_task(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.commit_batch(batch.stale, batch.notify);
                }
            }));
            return;
        }
        self.commit_batch(batch.stale, batch.notify);
    }

    /// Rebuild the nodes a batch left stale, then notify the changed ones.
    ///
    /// Inside another batch the work is handed to that batch instead.
    fn commit_batch(&self, stale: Vec<NodeKey>, notify: IndexSet<NodeKey, RandomState>) {
        let _guard = self.exclusive();
        let merged = self.with_graph(|graph| {
            if graph.batch.depth == 0 {
                graph.batch.phase = BatchPhase::Commit;
                return None;
            }
            graph.batch.stale.extend(stale.iter().cloned());
            graph.batch.notify.extend(notify.iter().cloned());
            Some(())
        });
        if merged.is_some() {
            return;
        }

        let mut rebuilt = 0;
        for key in stale {
            if self.rebuild(&key) {
                rebuilt += 1;
            }
        }
        self.with_graph(|graph| graph.batch.phase = BatchPhase::Disabled);
        let mut notified = 0;
        for key in notify {
            if self.notify(&key) {
                notified += 1;
            }
        }
        self.inner.tracer.on_batch_commit(rebuilt, notified);
    }

    /// Settle a node left stale by a batch. Returns whether it was recomputed.
    fn rebuild(&self, key: &NodeKey) -> bool {
        let Some((def, inactive)) = self.with_graph(|graph| {
            let node = graph.nodes.get(key)?;
            if node.state == NodeState::Valid || node.computing {
                return None;
            }
            Some((node.atom.clone(), graph.is_inactive(node)))
        }) else {
            return false;
        };
        if inactive {
            self.invalidate_children(key, &def);
            self.with_graph(|graph| {
                if let Some(node) = graph.nodes.get_mut(key) {
                    node.skip_invalidation = true;
                }
            });
            false
        } else {
            self.compute(key);
            true
        }
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    fn schedule_removal(&self, key: &NodeKey) {
        let deferred = self.with_graph(|graph| {
            if graph.operations == 0 {
                return false;
            }
            if !graph.pending_removals.contains(key) {
                graph.pending_removals.push(key.clone());
            }
            true
        });
        if !deferred {
            self.dispatch_removal(key.clone());
        }
    }

    fn dispatch_removal(&self, key: NodeKey) {
        let registry = self.downgrade();
        self.inner.scheduler.schedule_task(Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.removal_check(&key);
            }
        }));
    }

    fn removal_check(&self, key: &NodeKey) {
        let _guard = self.exclusive();
        let removable = self.with_graph(|graph| graph.nodes.get(key).is_some_and(Node::can_be_removed));
        if removable {
            self.remove_node(key);
        }
    }

    /// Remove an unobserved node, or park it until its idle TTL expires.
    fn remove_node(&self, key: &NodeKey) {
        let Some(ttl) = self.with_graph(|graph| {
            graph
                .nodes
                .get(key)
                .map(|node| node.atom.idle_ttl.or(self.inner.default_idle_ttl))
        }) else {
            return;
        };
        match ttl.filter(|ttl| !ttl.is_zero()) {
            Some(ttl) => self.set_idle_timeout(key, ttl),
            None => self.destroy_node(key),
        }
    }

    fn set_idle_timeout(&self, key: &NodeKey, ttl: Duration) {
        let resolution = (self.inner.timeout_resolution.as_millis() as u64).max(1);
        let ttl_millis = (ttl.as_millis() as u64).div_ceil(resolution) * resolution;
        let now = self.inner.scheduler.now().as_millis() as u64;
        let deadline = now + ttl_millis;
        let bucket = deadline - deadline % resolution + resolution;

        let Some((def, new_bucket)) = self.with_graph(|graph| {
            if graph.node_timeouts.contains_key(key) {
                return None;
            }
            let def = graph.nodes.get(key)?.atom.clone();
            graph.node_timeouts.insert(key.clone(), bucket);
            let keys = graph.timeout_buckets.entry(bucket).or_default();
            let new_bucket = keys.is_empty();
            keys.push(key.clone());
            Some((def, new_bucket))
        }) else {
            return;
        };

        self.inner
            .tracer
            .on_idle_timeout_scheduled(tracer_key(&def), Duration::from_millis(ttl_millis));
        if new_bucket {
            let registry = self.downgrade();
            self.inner.scheduler.schedule_timeout(
                Duration::from_millis(bucket - now),
                Box::new(move || {
                    if let Some(registry) = registry.upgrade() {
                        registry.sweep_bucket(bucket);
                    }
                }),
            );
        }
    }

    fn sweep_bucket(&self, bucket: u64) {
        let _guard = self.exclusive();
        let keys = self.with_graph(|graph| graph.timeout_buckets.remove(&bucket).unwrap_or_default());
        for key in keys {
            let expired = self.with_graph(|graph| {
                if graph.node_timeouts.get(&key) != Some(&bucket) {
                    return false;
                }
                graph.node_timeouts.remove(&key);
                graph.nodes.get(&key).is_some_and(Node::can_be_removed)
            });
            if expired {
                self.destroy_node(&key);
            }
        }
    }

    /// Evict the node under `key`, run its finalizers, and release its parents.
    fn destroy_node(&self, key: &NodeKey) {
        let Some(mut node) = self.with_graph(|graph| {
            graph.node_timeouts.remove(key);
            graph.nodes.shift_remove(key)
        }) else {
            return;
        };
        node.state = NodeState::Removed;
        node.listeners.clear();
        self.inner.tracer.on_node_removed(tracer_key(&node.atom));

        let finalizers = node.end_lifetime().unwrap_or_default();
        let mut parents = std::mem::take(&mut node.parents);
        parents.extend(node.previous_parents.take().unwrap_or_default());
        drop(node);

        for finalizer in finalizers {
            finalizer();
        }
        for parent in parents {
            let removable = self.with_graph(|graph| {
                graph.nodes.get_mut(&parent).is_some_and(|node| {
                    node.remove_child(key);
                    node.can_be_removed()
                })
            });
            if removable {
                self.remove_node(&parent);
            }
        }
    }
}
