//! Optimistic updates: show a predicted value while a mutation is in flight.

use std::future::Future;

use crate::atom::{with_refresh, Atom, AtomValue, Writable};
use crate::context::{Context, WriteContext};
use crate::function::FnAtom;
use crate::result::AsyncResult;

/// A pending optimistic value. While it is waiting, the optimistic atom
/// shows its value instead of the base atom's.
pub type Transition<A> = Atom<AsyncResult<A, ()>>;

/// An atom mirroring a base atom, overridable by writing a [`Transition`].
pub type Optimistic<A> = Writable<A, Transition<A>>;

impl<A: AtomValue> Atom<A> {
    /// Mirror `base`, showing the value of the latest transition written to
    /// the returned atom until that transition settles.
    ///
    /// Refreshing the optimistic atom refreshes `base`.
    pub fn optimistic(base: &Atom<A>) -> Optimistic<A> {
        let current = Atom::make(None::<Transition<A>>);
        let (read_current, read_base, refreshed) = (current.clone(), base.clone(), base.clone());
        let optimistic = Atom::writable(
            move |ctx: &Context<A>| {
                if let Some(transition) = ctx.get(&read_current) {
                    let pending = ctx.get(&transition);
                    if pending.is_waiting() {
                        if let Some(value) = pending.value() {
                            return value.clone();
                        }
                    }
                }
                ctx.get(&read_base)
            },
            move |ctx: &WriteContext<A>, transition: Transition<A>| {
                ctx.set(&current, Some(transition));
            },
        );
        with_refresh(optimistic, move |registry| registry.refresh(&refreshed))
    }
}

impl<T: AtomValue, E: AtomValue> Atom<AsyncResult<T, E>> {
    /// A function atom that applies `reducer` to `target` right away and
    /// then runs `f`.
    ///
    /// On success `target` is refreshed so it picks up the confirmed value.
    /// On failure the prediction is dropped and `target` shows its base
    /// value again.
    pub fn optimistic_fn<A, Arg, F>(
        target: &Optimistic<A>,
        reducer: impl Fn(&A, &Arg) -> A + Send + Sync + 'static,
        f: impl Fn(Arg, &Context<AsyncResult<T, E>>) -> F + Send + Sync + 'static,
    ) -> FnAtom<T, E, Arg>
    where
        A: AtomValue,
        Arg: AtomValue,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let target = target.clone();
        Self::fn_(move |arg: Arg, ctx: &Context<AsyncResult<T, E>>| {
            // Read without a dependency so the prediction does not rerun the call.
            let predicted = reducer(&ctx.once(&target), &arg);
            let transition = Atom::make(AsyncResult::<A, ()>::success_with(predicted.clone(), true));
            ctx.set(&target, transition.clone().into_atom());

            let future = f(arg, ctx);
            let registry = ctx.registry().downgrade();
            let target = target.clone();
            async move {
                let exit = future.await;
                if let Some(registry) = registry.upgrade() {
                    registry.batch(|| match &exit {
                        Ok(_) => {
                            registry.refresh(&target);
                            registry.set(&transition, AsyncResult::success(predicted));
                        }
                        Err(_) => registry.set(&transition, AsyncResult::fail(())),
                    });
                }
                exit
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::scheduler::TaskQueue;
    use std::sync::Arc;

    #[test]
    fn waiting_transition_overrides_base() {
        let registry = Registry::builder().scheduler(Arc::new(TaskQueue::manual())).build();
        let base = Atom::make(1);
        let optimistic = Atom::optimistic(&base);
        let _mount = registry.mount(&optimistic);
        assert_eq!(registry.get(&optimistic), 1);

        let transition = Atom::make(AsyncResult::<i32, ()>::success_with(5, true));
        registry.set(&optimistic, transition.clone().into_atom());
        assert_eq!(registry.get(&optimistic), 5);

        registry.set(&transition, AsyncResult::success(5));
        assert_eq!(registry.get(&optimistic), 1);
    }
}
