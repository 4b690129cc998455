//! Memoized atom constructors keyed by argument.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::atom::{AtomDef, AtomRef};

type RandomState = ahash::RandomState;

/// Returns the same atom for equal arguments.
///
/// Members are held weakly: once every handle to a member atom (including
/// the registry nodes built from it) is gone, the entry is dropped and the
/// next `get` builds a fresh atom. Cloning a family shares its members.
pub struct Family<Arg, R> {
    inner: Arc<FamilyInner<Arg, R>>,
}

struct FamilyInner<Arg, R> {
    create: Box<dyn Fn(Arg) -> R + Send + Sync>,
    members: Mutex<HashMap<Arg, Weak<AtomDef>, RandomState>>,
}

/// Build a [`Family`] from `create`.
pub fn family<Arg, R>(create: impl Fn(Arg) -> R + Send + Sync + 'static) -> Family<Arg, R>
where
    Arg: Hash + Eq + Clone,
    R: AtomRef,
{
    Family::new(create)
}

impl<Arg, R> Family<Arg, R>
where
    Arg: Hash + Eq + Clone,
    R: AtomRef,
{
    pub fn new(create: impl Fn(Arg) -> R + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(FamilyInner {
                create: Box::new(create),
                members: Mutex::new(HashMap::default()),
            }),
        }
    }

    /// The member for `arg`, created on first use.
    pub fn get(&self, arg: Arg) -> R {
        if let Some(def) = self.inner.members.lock().get(&arg).and_then(Weak::upgrade) {
            return R::from_def(def);
        }
        // `create` may itself use this family.
        let atom = (self.inner.create)(arg.clone());
        let mut members = self.inner.members.lock();
        if let Some(def) = members.get(&arg).and_then(Weak::upgrade) {
            return R::from_def(def);
        }
        members.retain(|_, member| member.strong_count() > 0);
        members.insert(arg, Arc::downgrade(atom.def()));
        atom
    }

    /// Number of live members.
    pub fn len(&self) -> usize {
        self.inner
            .members
            .lock()
            .values()
            .filter(|member| member.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<Arg, R> Clone for Family<Arg, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Arg, R> fmt::Debug for Family<Arg, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Family")
            .field("members", &self.inner.members.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn equal_arguments_share_an_atom() {
        let created = Arc::new(AtomicU32::new(0));
        let counter = created.clone();
        let users = family(move |id: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            Atom::make(id * 10)
        });

        let a = users.get(1);
        let b = users.get(1);
        let c = users.get(2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(users.len(), 2);
    }

    #[test]
    fn dropped_members_are_rebuilt() {
        let users = family(|id: u32| Atom::make(id));
        let first = users.get(7).id();
        assert!(users.is_empty());
        let second = users.get(7);
        assert_ne!(first, second.id());
        assert_eq!(users.len(), 1);
    }
}
