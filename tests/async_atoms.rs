//! Effect, stream, function, and pull atoms driven through a manual task queue.

use atom_flow::{
    AsyncResult, Atom, AtomError, AtomRef, Cause, Computation, FnInput, FnOptions, PullOptions,
    Registry, SubscribeOptions, TaskQueue,
};
use futures::channel::{mpsc, oneshot};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

type Outcome = AsyncResult<u32, String>;

fn registry() -> (Registry, Arc<TaskQueue>) {
    let queue = Arc::new(TaskQueue::manual());
    let registry = Registry::builder().scheduler(queue.clone()).build();
    (registry, queue)
}

/// Futures whose outcomes are supplied by the test, oldest first.
#[derive(Clone, Default)]
struct Pending(Arc<Mutex<Vec<oneshot::Sender<Result<u32, String>>>>>);

impl Pending {
    fn next(&self) -> impl Future<Output = Result<u32, String>> + Send + 'static {
        let (sender, receiver) = oneshot::channel();
        self.0.lock().unwrap().push(sender);
        async move {
            receiver
                .await
                .unwrap_or_else(|_| Err("dropped".to_string()))
        }
    }

    /// Settle the oldest outstanding future. Returns false if it was cancelled.
    fn resolve(&self, outcome: Result<u32, String>) -> bool {
        let sender = self.0.lock().unwrap().remove(0);
        sender.send(outcome).is_ok()
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

fn record<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    (seen, move |value| log.lock().unwrap().push(value))
}

fn explode() -> Result<u32, String> {
    panic!("kaboom")
}

// ============================================================================
// Effects
// ============================================================================

#[test]
fn effect_goes_from_waiting_to_success() {
    let (registry, queue) = registry();
    let pending = Pending::default();
    let source = pending.clone();
    let user = Atom::effect(move |_| source.next());

    let (seen, listener) = record::<Outcome>();
    let _sub = registry.subscribe(&user, listener, SubscribeOptions { immediate: true });
    assert_eq!(*seen.lock().unwrap(), vec![AsyncResult::initial(true)]);

    assert!(pending.resolve(Ok(1)));
    queue.run_until_idle();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![AsyncResult::initial(true), AsyncResult::success(1)]
    );
}

#[test]
fn refresh_shows_previous_result_while_waiting() {
    let (registry, queue) = registry();
    let pending = Pending::default();
    let source = pending.clone();
    let user = Atom::effect(move |_| source.next());
    let _mount = registry.mount(&user);
    pending.resolve(Ok(1));
    queue.run_until_idle();

    registry.refresh(&user);
    assert_eq!(registry.get(&user), AsyncResult::success_with(1, true));

    pending.resolve(Ok(2));
    queue.run_until_idle();
    assert_eq!(registry.get(&user), AsyncResult::success(2));
}

#[test]
fn superseded_runs_are_cancelled_before_the_next_starts() {
    let (registry, queue) = registry();
    let pending = Pending::default();
    let log = Arc::new(Mutex::new(Vec::new()));
    let runs = Arc::new(AtomicU32::new(0));

    let (source, events, counter) = (pending.clone(), log.clone(), runs.clone());
    let user = Atom::effect(move |ctx| {
        let run = counter.fetch_add(1, Ordering::SeqCst) + 1;
        events.lock().unwrap().push(format!("start {run}"));
        let events = events.clone();
        ctx.add_finalizer(move || events.lock().unwrap().push(format!("stop {run}")));
        source.next()
    });
    let _mount = registry.mount(&user);
    registry.refresh(&user);
    assert_eq!(*log.lock().unwrap(), vec!["start 1", "stop 1", "start 2"]);

    queue.run_until_idle();
    assert_eq!(pending.len(), 2);
    assert!(!pending.resolve(Ok(1)));
    assert!(pending.resolve(Ok(2)));
    queue.run_until_idle();
    assert_eq!(registry.get(&user), AsyncResult::success(2));
}

#[test]
fn failure_keeps_the_previous_success() {
    let (registry, queue) = registry();
    let pending = Pending::default();
    let source = pending.clone();
    let user = Atom::effect(move |_| source.next());
    let _mount = registry.mount(&user);
    pending.resolve(Ok(1));
    queue.run_until_idle();

    registry.refresh(&user);
    pending.resolve(Err("boom".to_string()));
    queue.run_until_idle();

    let result = registry.get(&user);
    assert!(result.is_failure());
    assert!(!result.is_waiting());
    assert_eq!(result.cause(), Some(&Cause::Fail("boom".to_string())));
    assert_eq!(result.value(), Some(&1));
}

#[test]
fn ready_effects_settle_synchronously() {
    let (registry, _queue) = registry();
    let answer = Atom::effect(|_| async { Ok::<u32, String>(42) });
    assert_eq!(registry.get(&answer), AsyncResult::success(42));
}

#[test]
fn panics_become_defects() {
    let (registry, _queue) = registry();
    let effect = Atom::effect(|_| async { explode() });
    let result = registry.get(&effect);
    let cause = result.cause().unwrap();
    assert!(cause.is_die());
    assert!(cause.to_string().contains("kaboom"));

    let computed = Atom::<Outcome>::computed(|_| panic!("sync"));
    let result = registry.get(&computed);
    assert!(result.cause().is_some_and(Cause::is_die));
}

#[test]
fn failures_unwrap_into_dependents_explicitly() {
    let (registry, _queue) = registry();
    let source = Atom::make(AsyncResult::<u32, String>::fail("missing".to_string()));
    let upstream = source.clone();
    let dependent = Atom::<Outcome>::computed(move |ctx| match ctx.get(&upstream).get_or_throw() {
        Ok(value) => Computation::value(value + 1),
        Err(Cause::Fail(error)) => Computation::fail(format!("upstream: {error}")),
        Err(_) => Computation::fail("upstream defect".to_string()),
    });

    assert_eq!(
        registry.get(&dependent).cause(),
        Some(&Cause::Fail("upstream: missing".to_string()))
    );
    registry.set(&source, AsyncResult::success(1));
    assert_eq!(registry.get(&dependent), AsyncResult::success(2));
}

#[test]
fn awaiting_a_dependency_result() {
    let (registry, queue) = registry();
    let pending = Pending::default();
    let source = pending.clone();
    let user = Atom::effect(move |_| source.next());
    let upstream = user.clone();
    let doubled = Atom::effect(move |ctx| {
        let settled = ctx.result(&upstream);
        async move {
            settled
                .await
                .map(|n| n * 2)
                .map_err(|_| "upstream failed".to_string())
        }
    });

    let _mount = registry.mount(&doubled);
    assert_eq!(registry.get(&doubled), AsyncResult::initial(true));
    pending.resolve(Ok(21));
    queue.run_until_idle();
    assert_eq!(registry.get(&doubled), AsyncResult::success(42));
}

// ============================================================================
// Streams
// ============================================================================

#[test]
fn stream_items_arrive_while_waiting() {
    let (registry, queue) = registry();
    let (sender, receiver) = mpsc::unbounded::<Result<u32, String>>();
    let receiver = Mutex::new(Some(receiver));
    let ticks = Atom::stream(move |_| receiver.lock().unwrap().take().expect("stream is read once"));

    let (seen, listener) = record::<Outcome>();
    let _sub = registry.subscribe(&ticks, listener, SubscribeOptions { immediate: true });

    sender.unbounded_send(Ok(1)).unwrap();
    queue.run_until_idle();
    sender.unbounded_send(Ok(2)).unwrap();
    queue.run_until_idle();
    drop(sender);
    queue.run_until_idle();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            AsyncResult::initial(true),
            AsyncResult::success_with(1, true),
            AsyncResult::success_with(2, true),
            AsyncResult::success(2),
        ]
    );
}

#[test]
fn stream_error_wraps_the_last_item() {
    let (registry, _queue) = registry();
    let ticks = Atom::stream(|_| futures::stream::iter(vec![Ok(1), Err("closed".to_string()), Ok(3)]));
    let result: Outcome = registry.get(&ticks);
    assert_eq!(result.cause(), Some(&Cause::Fail("closed".to_string())));
    assert_eq!(result.value(), Some(&1));
    assert!(!result.is_waiting());
}

#[test]
fn empty_stream_is_a_defect() {
    let (registry, _queue) = registry();
    let nothing = Atom::<Outcome>::stream(|_| futures::stream::empty());
    let result = registry.get(&nothing);
    let cause = result.cause().unwrap();
    assert!(cause.is_die());
    assert!(cause.to_string().contains(&AtomError::EmptyStream.to_string()));
}

// ============================================================================
// Function atoms
// ============================================================================

#[test]
fn every_call_reruns_even_with_the_same_argument() {
    let (registry, _queue) = registry();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let echo = Atom::fn_(move |n: u32, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<u32, String>(n) }
    });
    let _mount = registry.mount(&echo);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    registry.call(&echo, 3);
    registry.call(&echo, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(registry.get(&echo), AsyncResult::success(3));
}

#[test]
fn interrupt_cancels_the_run_in_flight() {
    let (registry, queue) = registry();
    let pending = Pending::default();
    let source = pending.clone();
    let save = Atom::fn_(move |_: u32, _| source.next());
    let _mount = registry.mount(&save);

    registry.call(&save, 1);
    pending.resolve(Ok(1));
    queue.run_until_idle();

    registry.call(&save, 2);
    assert!(registry.get(&save).is_waiting());
    registry.set(&save, FnInput::Interrupt);

    let result = registry.get(&save);
    assert!(result.is_interrupted());
    assert_eq!(result.value(), Some(&1));
    queue.run_until_idle();
    assert!(!pending.resolve(Ok(2)));
}

#[test]
fn successful_calls_refresh_reactivity_keys() {
    let (registry, _queue) = registry();
    let loads = Arc::new(AtomicU32::new(0));
    let counter = loads.clone();
    let todos = Atom::readable(move |_| counter.fetch_add(1, Ordering::SeqCst) + 1).with_reactivity(["todos"]);
    let add = Atom::fn_with(
        |n: u32, _| async move { Ok::<u32, String>(n) },
        FnOptions {
            reactivity_keys: vec!["todos".to_string()],
        },
    );
    let _todos = registry.mount(&todos);
    let _add = registry.mount(&add);
    assert_eq!(registry.get(&todos), 1);

    registry.call(&add, 1);
    assert_eq!(registry.get(&todos), 2);
}

#[test]
fn function_streams_report_progress() {
    let (registry, _queue) = registry();
    let countdown = Atom::fn_stream(|from: u32, _| futures::stream::iter((1..=from).rev().map(Ok::<u32, String>)));
    let _mount = registry.mount(&countdown);
    registry.call(&countdown, 3);
    assert_eq!(registry.get(&countdown), AsyncResult::success(1));
}

// ============================================================================
// Pull
// ============================================================================

#[test]
fn pull_accumulates_one_item_per_write() {
    let (registry, _queue) = registry();
    let pages = Atom::pull(
        |_| futures::stream::iter(vec![Ok::<u32, String>(1), Ok(2)]),
        PullOptions::default(),
    );
    let _mount = registry.mount(&pages);

    let chunk = registry.get(&pages).value().cloned().unwrap();
    assert_eq!((chunk.done, chunk.items), (false, vec![1]));

    registry.set(&pages, ());
    let chunk = registry.get(&pages).value().cloned().unwrap();
    assert_eq!((chunk.done, chunk.items), (false, vec![1, 2]));

    registry.set(&pages, ());
    let chunk = registry.get(&pages).value().cloned().unwrap();
    assert_eq!((chunk.done, chunk.items), (true, vec![1, 2]));

    registry.set(&pages, ());
    assert!(registry.get(&pages).value().unwrap().done);
}

#[test]
fn pull_refresh_starts_over() {
    let (registry, _queue) = registry();
    let pages = Atom::pull(
        |_| futures::stream::iter(vec![Ok::<u32, String>(1), Ok(2)]),
        PullOptions::default(),
    );
    let _mount = registry.mount(&pages);
    registry.set(&pages, ());

    registry.refresh(&pages);
    let chunk = registry.get(&pages).value().cloned().unwrap();
    assert_eq!(chunk.items, vec![1]);
}

#[test]
fn pull_without_accumulation_keeps_the_latest_item() {
    let (registry, _queue) = registry();
    let pages = Atom::pull(
        |_| futures::stream::iter(vec![Ok::<u32, String>(1), Ok(2)]),
        PullOptions {
            disable_accumulation: true,
        },
    );
    let _mount = registry.mount(&pages);
    registry.set(&pages, ());
    assert_eq!(registry.get(&pages).value().unwrap().items, vec![2]);
}
