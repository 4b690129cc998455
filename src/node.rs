//! Per-registry node records.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use slab::Slab;

use crate::atom::AtomDef;

/// A type-erased atom value.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

pub(crate) type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

pub(crate) type Finalizer = Box<dyn FnOnce() + Send>;

/// Process-unique identity of an atom definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(u64);

impl AtomId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        AtomId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Key of a node in a registry.
///
/// Serializable atoms are keyed by their string key, so distinct atom values
/// sharing a key share a node. Everything else is keyed by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Id(AtomId),
    Key(Arc<str>),
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::Id(id) => write!(f, "{id}"),
            NodeKey::Key(key) => write!(f, "{key}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    Uninitialized,
    Stale,
    Valid,
    Removed,
}

/// Scope of one computation of a node.
///
/// Disposed when the node is invalidated or removed. Contexts and in-flight
/// effects check it to drop late writes.
#[derive(Debug, Default)]
pub(crate) struct Lifetime {
    disposed: AtomicBool,
}

impl Lifetime {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

pub(crate) struct Node {
    pub(crate) atom: Arc<AtomDef>,
    /// Distinguishes this node from a later node created under the same key.
    pub(crate) epoch: u64,
    pub(crate) state: NodeState,
    pub(crate) value: Option<Value>,
    pub(crate) updated_at: u64,
    pub(crate) parents: Vec<NodeKey>,
    /// Parents of the previous computation not yet re-read by the current one.
    pub(crate) previous_parents: Option<Vec<NodeKey>>,
    pub(crate) children: Vec<NodeKey>,
    pub(crate) listeners: Slab<Listener>,
    pub(crate) lifetime: Option<Arc<Lifetime>>,
    pub(crate) finalizers: Vec<Finalizer>,
    pub(crate) skip_invalidation: bool,
    pub(crate) waiting_for_value: bool,
    pub(crate) computing: bool,
    /// A dependency changed after the running read had already seen it.
    pub(crate) dependency_changed: bool,
}

impl Node {
    pub(crate) fn new(atom: Arc<AtomDef>) -> Self {
        static EPOCH: AtomicU64 = AtomicU64::new(1);
        Self {
            atom,
            epoch: EPOCH.fetch_add(1, Ordering::Relaxed),
            state: NodeState::Uninitialized,
            value: None,
            updated_at: 0,
            parents: Vec::new(),
            previous_parents: None,
            children: Vec::new(),
            listeners: Slab::new(),
            lifetime: None,
            finalizers: Vec::new(),
            skip_invalidation: false,
            waiting_for_value: false,
            computing: false,
            dependency_changed: false,
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.value.is_some()
    }

    pub(crate) fn can_be_removed(&self) -> bool {
        !self.atom.keep_alive
            && self.listeners.is_empty()
            && self.children.is_empty()
            && self.state != NodeState::Removed
    }

    /// Records `parent` as read by the current computation.
    ///
    /// Returns true when the parent does not yet list this node as a child.
    pub(crate) fn add_parent(&mut self, parent: &NodeKey) -> bool {
        if self.parents.contains(parent) {
            return false;
        }
        self.parents.push(parent.clone());
        if let Some(previous) = &mut self.previous_parents {
            if let Some(index) = previous.iter().position(|p| p == parent) {
                previous.swap_remove(index);
                return false;
            }
        }
        true
    }

    pub(crate) fn remove_child(&mut self, child: &NodeKey) {
        if let Some(index) = self.children.iter().position(|c| c == child) {
            self.children.swap_remove(index);
        }
    }

    /// Ends the current computation scope.
    ///
    /// Returns the finalizers to run, in registration order. The current
    /// parents become previous parents so edges that the next computation
    /// does not re-read can be dropped afterwards.
    pub(crate) fn end_lifetime(&mut self) -> Option<Vec<Finalizer>> {
        let lifetime = self.lifetime.take()?;
        lifetime.dispose();
        if !self.parents.is_empty() {
            let parents = std::mem::take(&mut self.parents);
            match &mut self.previous_parents {
                Some(previous) => previous.extend(parents),
                None => self.previous_parents = Some(parents),
            }
        }
        Some(std::mem::take(&mut self.finalizers))
    }

    pub(crate) fn listener_snapshot(&self) -> Vec<Listener> {
        self.listeners.iter().map(|(_, l)| l.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use crate::AtomRef;

    fn node() -> Node {
        Node::new(Atom::make(0).def().clone())
    }

    #[test]
    fn add_parent_reuses_previous_edges() {
        let a = NodeKey::Id(AtomId::next());
        let b = NodeKey::Id(AtomId::next());
        let mut node = node();
        assert!(node.add_parent(&a));
        assert!(!node.add_parent(&a));

        node.lifetime = Some(Arc::new(Lifetime::default()));
        node.end_lifetime();
        assert!(node.parents.is_empty());

        assert!(!node.add_parent(&a));
        assert!(node.add_parent(&b));
        assert_eq!(node.previous_parents, Some(Vec::new()));
    }

    #[test]
    fn end_lifetime_disposes_once() {
        let mut node = node();
        let lifetime = Arc::new(Lifetime::default());
        node.lifetime = Some(lifetime.clone());
        node.finalizers.push(Box::new(|| {}));

        assert_eq!(node.end_lifetime().map(|f| f.len()), Some(1));
        assert!(lifetime.is_disposed());
        assert!(node.end_lifetime().is_none());
    }

    #[test]
    fn removable_only_without_observers() {
        let mut node = node();
        assert!(node.can_be_removed());
        node.children.push(NodeKey::Id(AtomId::next()));
        assert!(!node.can_be_removed());
    }
}
