//! Atom definitions: identity, read/write functions, and modifiers.
//!
//! An atom is an immutable, cheaply cloneable description of a value. It holds
//! no state: every [`Registry`](crate::Registry) keeps its own node per atom.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::{Context, ContextCore, WriteContext};
use crate::node::{AtomId, NodeKey, Value};
use crate::registry::Registry;
use crate::result::AsyncResult;

/// Values storable in an atom.
///
/// Equality drives change detection: writing or recomputing an equal value
/// does not invalidate dependents or notify subscribers.
pub trait AtomValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> AtomValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

pub(crate) type ReadFn = Arc<dyn Fn(ContextCore) -> Value + Send + Sync>;
pub(crate) type WriteFn = Arc<dyn Fn(&Registry, &NodeKey, Box<dyn Any + Send>) + Send + Sync>;
pub(crate) type RefreshFn = Arc<dyn Fn(&Registry) + Send + Sync>;

/// Debug label attached with [`AtomRef::with_label`].
#[derive(Debug, Clone)]
pub struct Label {
    pub name: Arc<str>,
    pub location: &'static Location<'static>,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{})",
            self.name,
            self.location.file(),
            self.location.line()
        )
    }
}

pub(crate) struct Codec {
    pub(crate) key: Arc<str>,
    pub(crate) encode: fn(&Value) -> serde_json::Result<serde_json::Value>,
    pub(crate) decode: fn(serde_json::Value) -> serde_json::Result<Value>,
    /// The value is an [`AsyncResult`], so an encoded `Initial` tag means "not loaded yet".
    pub(crate) async_result: bool,
}

fn is_async_result<A: ?Sized>() -> bool {
    let result = std::any::type_name::<AsyncResult<(), ()>>();
    let path = result.split('<').next().unwrap_or(result);
    std::any::type_name::<A>().split('<').next() == Some(path)
}

fn encode_value<A: Serialize + 'static>(value: &Value) -> serde_json::Result<serde_json::Value> {
    match value.downcast_ref::<A>() {
        Some(value) => serde_json::to_value(value),
        None => Err(<serde_json::Error as serde::ser::Error>::custom(
            "atom value has an unexpected type",
        )),
    }
}

fn decode_value<A: DeserializeOwned + Send + Sync + 'static>(
    json: serde_json::Value,
) -> serde_json::Result<Value> {
    Ok(Arc::new(serde_json::from_value::<A>(json)?))
}

fn value_eq<A: AtomValue>(a: &Value, b: &Value) -> bool {
    match (a.downcast_ref::<A>(), b.downcast_ref::<A>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Type-erased atom definition shared by all typed handles.
#[doc(hidden)]
#[derive(Clone)]
pub struct AtomDef {
    pub(crate) id: AtomId,
    pub(crate) read: ReadFn,
    pub(crate) write: Option<WriteFn>,
    pub(crate) refresh: Option<RefreshFn>,
    pub(crate) value_eq: fn(&Value, &Value) -> bool,
    pub(crate) type_name: &'static str,
    pub(crate) keep_alive: bool,
    pub(crate) lazy: bool,
    pub(crate) idle_ttl: Option<Duration>,
    pub(crate) label: Option<Label>,
    pub(crate) codec: Option<Arc<Codec>>,
}

impl AtomDef {
    pub(crate) fn new<A: AtomValue>(read: ReadFn) -> Self {
        Self {
            id: AtomId::next(),
            read,
            write: None,
            refresh: None,
            value_eq: value_eq::<A>,
            type_name: std::any::type_name::<A>(),
            keep_alive: false,
            lazy: true,
            idle_ttl: None,
            label: None,
            codec: None,
        }
    }

    pub(crate) fn key(&self) -> NodeKey {
        match &self.codec {
            Some(codec) => NodeKey::Key(codec.key.clone()),
            None => NodeKey::Id(self.id),
        }
    }

    /// A copy with a fresh identity and `modify` applied.
    pub(crate) fn derive(&self, modify: impl FnOnce(&mut AtomDef)) -> Arc<AtomDef> {
        let mut def = self.clone();
        def.id = AtomId::next();
        modify(&mut def);
        Arc::new(def)
    }

    pub(crate) fn debug_name(&self) -> String {
        match (&self.label, &self.codec) {
            (Some(label), _) => label.name.to_string(),
            (None, Some(codec)) => codec.key.to_string(),
            (None, None) => self.id.to_string(),
        }
    }
}

impl fmt::Debug for AtomDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomDef")
            .field("id", &self.id)
            .field("type", &self.type_name)
            .field("label", &self.label.as_ref().map(|l| l.to_string()))
            .field("keep_alive", &self.keep_alive)
            .field("lazy", &self.lazy)
            .field("idle_ttl", &self.idle_ttl)
            .field("writable", &self.write.is_some())
            .finish_non_exhaustive()
    }
}

fn erase_read<A: AtomValue>(read: impl Fn(&Context<A>) -> A + Send + Sync + 'static) -> ReadFn {
    Arc::new(move |core: ContextCore| -> Value { Arc::new(read(&Context::from_core(core))) })
}

fn erase_write<A: AtomValue, W: Send + 'static>(
    write: impl Fn(&WriteContext<A>, W) + Send + Sync + 'static,
) -> WriteFn {
    Arc::new(move |registry: &Registry, key: &NodeKey, value: Box<dyn Any + Send>| {
        if let Ok(value) = value.downcast::<W>() {
            write(&WriteContext::new(registry.clone(), key.clone()), *value);
        }
    })
}

/// A copy of `atom` whose refresh runs `refresh` instead of recomputing it.
pub(crate) fn with_refresh<R: AtomRef>(atom: R, refresh: impl Fn(&Registry) + Send + Sync + 'static) -> R {
    let refresh: RefreshFn = Arc::new(refresh);
    R::from_def(atom.def().derive(|def| def.refresh = Some(refresh)))
}

/// Handle shared by [`Atom`] and [`Writable`]: identity, inspection, and
/// the modifiers that derive a configured copy of an atom.
///
/// Every modifier returns a new atom with a new identity; the receiver is
/// left untouched.
pub trait AtomRef: Clone + Send + Sync + 'static {
    /// Type of the value the atom holds.
    type Value: AtomValue;

    #[doc(hidden)]
    fn def(&self) -> &Arc<AtomDef>;

    #[doc(hidden)]
    fn from_def(def: Arc<AtomDef>) -> Self;

    fn id(&self) -> AtomId {
        self.def().id
    }

    /// The registry key this atom's node is stored under.
    fn node_key(&self) -> NodeKey {
        self.def().key()
    }

    fn label(&self) -> Option<&Label> {
        self.def().label.as_ref()
    }

    fn serializable_key(&self) -> Option<&str> {
        self.def().codec.as_ref().map(|codec| &*codec.key)
    }

    fn is_keep_alive(&self) -> bool {
        self.def().keep_alive
    }

    fn is_lazy(&self) -> bool {
        self.def().lazy
    }

    /// Never garbage-collect this atom's node.
    fn keep_alive(self) -> Self {
        Self::from_def(self.def().derive(|def| def.keep_alive = true))
    }

    /// A non-lazy atom recomputes as soon as a dependency changes, even when
    /// nothing observes it. Atoms are lazy by default.
    fn set_lazy(self, lazy: bool) -> Self {
        Self::from_def(self.def().derive(|def| def.lazy = lazy))
    }

    /// Keep the node for `ttl` after it becomes unobserved.
    fn set_idle_ttl(self, ttl: Duration) -> Self {
        Self::from_def(self.def().derive(|def| def.idle_ttl = Some(ttl)))
    }

    #[track_caller]
    fn with_label(self, name: impl Into<String>) -> Self {
        let label = Label {
            name: Arc::from(name.into()),
            location: Location::caller(),
        };
        Self::from_def(self.def().derive(|def| def.label = Some(label)))
    }

    /// Key the atom by `key` and include it in dehydrated snapshots.
    fn serializable(self, key: impl Into<String>) -> Self
    where
        Self::Value: Serialize + DeserializeOwned,
    {
        let codec = Arc::new(Codec {
            key: Arc::from(key.into()),
            encode: encode_value::<Self::Value>,
            decode: decode_value::<Self::Value>,
            async_result: is_async_result::<Self::Value>(),
        });
        Self::from_def(self.def().derive(|def| def.codec = Some(codec)))
    }

    /// Register the atom under reactivity `keys` while it is computed.
    ///
    /// [`Registry::invalidate_reactivity`] with any of those keys refreshes it.
    fn with_reactivity<I, K>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: Arc<[Arc<str>]> = keys.into_iter().map(|k| Arc::from(k.into())).collect();
        let read = self.def().read.clone();
        Self::from_def(self.def().derive(|def| {
            def.read = Arc::new(move |core: ContextCore| {
                core.track_reactivity(&keys);
                read(core)
            });
        }))
    }

    /// Refresh the atom whenever `signal` changes value.
    fn refresh_on_signal<S: AtomRef>(self, signal: &S) -> Self {
        let signal = signal.def().clone();
        let read = self.def().read.clone();
        Self::from_def(self.def().derive(|def| {
            def.read = Arc::new(move |core: ContextCore| {
                core.refresh_when_changed(&signal);
                read(core)
            });
        }))
    }
}

/// A read-only atom of `A`.
pub struct Atom<A> {
    def: Arc<AtomDef>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for Atom<A> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> PartialEq for Atom<A> {
    fn eq(&self, other: &Self) -> bool {
        self.def.id == other.def.id
    }
}

impl<A> Eq for Atom<A> {}

impl<A> Hash for Atom<A> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.def.id.hash(state);
    }
}

impl<A> fmt::Debug for Atom<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atom({})", self.def.debug_name())
    }
}

impl<A: AtomValue> AtomRef for Atom<A> {
    type Value = A;

    fn def(&self) -> &Arc<AtomDef> {
        &self.def
    }

    fn from_def(def: Arc<AtomDef>) -> Self {
        Self {
            def,
            _marker: PhantomData,
        }
    }
}

impl<A: AtomValue> Atom<A> {
    /// An atom derived by `read`. Every atom read through the context becomes
    /// a dependency.
    pub fn readable(read: impl Fn(&Context<A>) -> A + Send + Sync + 'static) -> Self {
        Self::from_def(Arc::new(AtomDef::new::<A>(erase_read(read))))
    }

    /// A writable atom holding `initial` until it is set.
    pub fn make(initial: A) -> Writable<A> {
        Atom::writable(move |_| initial.clone(), |ctx, value| ctx.set_self(value))
    }

    /// An atom with a custom read and a write function accepting `W`.
    pub fn writable<W: Send + 'static>(
        read: impl Fn(&Context<A>) -> A + Send + Sync + 'static,
        write: impl Fn(&WriteContext<A>, W) + Send + Sync + 'static,
    ) -> Writable<A, W> {
        let mut def = AtomDef::new::<A>(erase_read(read));
        def.write = Some(erase_write(write));
        Writable::from_def(Arc::new(def))
    }

    pub(crate) fn with_refresh(self, refresh: impl Fn(&Registry) + Send + Sync + 'static) -> Self {
        with_refresh(self, refresh)
    }

    /// Derive an atom by applying `f` to this atom's value.
    ///
    /// Refreshing the derived atom refreshes this one.
    pub fn map<B: AtomValue>(&self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Atom<B> {
        let source = self.clone();
        let refreshed = self.clone();
        Atom::readable(move |ctx| f(ctx.get(&source))).with_refresh(move |registry| registry.refresh(&refreshed))
    }

    /// Derive an atom from a read function that receives this atom.
    ///
    /// Refreshing the derived atom refreshes this one.
    pub fn transform<B: AtomValue>(
        &self,
        read: impl Fn(&Context<B>, &Atom<A>) -> B + Send + Sync + 'static,
    ) -> Atom<B> {
        let source = self.clone();
        let refreshed = self.clone();
        Atom::readable(move |ctx| read(ctx, &source)).with_refresh(move |registry| registry.refresh(&refreshed))
    }
}

impl<T: AtomValue, E: AtomValue> Atom<AsyncResult<T, E>> {
    /// Map the success value, keeping the loading and failure states.
    pub fn map_result<U: AtomValue>(
        &self,
        f: impl Fn(T) -> U + Send + Sync + 'static,
    ) -> Atom<AsyncResult<U, E>> {
        self.map(move |result| result.map(&f))
    }

    /// While this atom is `Initial`, show `fallback` marked as waiting.
    pub fn with_fallback(&self, fallback: &Atom<AsyncResult<T, E>>) -> Atom<AsyncResult<T, E>> {
        let fallback = fallback.clone();
        self.transform(move |ctx, source| {
            let result = ctx.get(source);
            if result.is_initial() {
                ctx.get(&fallback).waiting()
            } else {
                result
            }
        })
    }
}

/// An atom that also accepts writes of `W`.
///
/// Dereferences to the readable [`Atom`], so it can be passed anywhere a
/// read-only atom is expected.
pub struct Writable<A, W = A> {
    atom: Atom<A>,
    _write: PhantomData<fn(W)>,
}

impl<A, W> Writable<A, W> {
    pub fn atom(&self) -> &Atom<A> {
        &self.atom
    }

    pub fn into_atom(self) -> Atom<A> {
        self.atom
    }
}

impl<A: AtomValue, W: Send + 'static> Writable<A, W> {
    /// Derive a writable atom; writes are forwarded to this atom unchanged.
    pub fn map<B: AtomValue>(&self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Writable<B, W> {
        let source = self.clone();
        let target = self.clone();
        let refreshed = self.clone();
        let mut def = AtomDef::new::<B>(erase_read(move |ctx: &Context<B>| f(ctx.get(&source))));
        def.write = Some(erase_write(move |ctx: &WriteContext<B>, value: W| {
            ctx.set(&target, value)
        }));
        def.refresh = Some(Arc::new(move |registry: &Registry| registry.refresh(&refreshed)));
        Writable::from_def(Arc::new(def))
    }
}

impl<A, W> Deref for Writable<A, W> {
    type Target = Atom<A>;

    fn deref(&self) -> &Atom<A> {
        &self.atom
    }
}

impl<A, W> Clone for Writable<A, W> {
    fn clone(&self) -> Self {
        Self {
            atom: self.atom.clone(),
            _write: PhantomData,
        }
    }
}

impl<A, W> PartialEq for Writable<A, W> {
    fn eq(&self, other: &Self) -> bool {
        self.atom == other.atom
    }
}

impl<A, W> Eq for Writable<A, W> {}

impl<A, W> Hash for Writable<A, W> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.atom.hash(state);
    }
}

impl<A, W> fmt::Debug for Writable<A, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Writable({})", self.atom.def.debug_name())
    }
}

impl<A: AtomValue, W: Send + 'static> AtomRef for Writable<A, W> {
    type Value = A;

    fn def(&self) -> &Arc<AtomDef> {
        &self.atom.def
    }

    fn from_def(def: Arc<AtomDef>) -> Self {
        Self {
            atom: Atom::from_def(def),
            _write: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_async_results_are_flagged() {
        assert!(is_async_result::<AsyncResult<u32, String>>());
        assert!(is_async_result::<AsyncResult<Vec<u8>, ()>>());
        assert!(!is_async_result::<u32>());
        assert!(!is_async_result::<Vec<AsyncResult<u32, String>>>());
        assert!(!is_async_result::<Option<AsyncResult<u32, String>>>());
    }

    #[test]
    fn modifiers_create_new_identities() {
        let base = Atom::make(1);
        let kept = base.clone().keep_alive();
        assert_ne!(base, kept);
        assert!(kept.is_keep_alive());
        assert!(!base.is_keep_alive());
        assert_eq!(base.clone(), base);
    }

    #[test]
    fn serializable_atoms_share_a_key() {
        let a = Atom::make(1).serializable("count");
        let b = Atom::make(2).serializable("count");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.node_key(), b.node_key());
        assert_eq!(a.serializable_key(), Some("count"));
    }

    #[test]
    fn labels_record_the_caller() {
        let atom = Atom::make(0).with_label("counter");
        let label = atom.label().unwrap();
        assert_eq!(&*label.name, "counter");
        assert!(label.location.file().ends_with("atom.rs"));
        assert_eq!(format!("{atom:?}"), "Writable(counter)");
    }

    #[test]
    fn codec_encodes_through_the_erased_value() {
        let atom = Atom::make(vec![1, 2]).serializable("list");
        let codec = atom.def().codec.clone().unwrap();
        let value: Value = Arc::new(vec![3, 4]);
        let json = (codec.encode)(&value).unwrap();
        assert_eq!(json, serde_json::json!([3, 4]));
        let back = (codec.decode)(json).unwrap();
        assert!((atom.def().value_eq)(&back, &value));
    }
}
