//! Node lifecycle: garbage collection, idle TTL, keep-alive, finalizers, disposal.

use atom_flow::{
    AsyncResult, Atom, AtomRef, Context, EventCollector, Registry, Scheduler, SubscribeOptions, Task,
    TaskQueue, TraceEvent,
};
use futures::channel::oneshot;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn registry() -> (Registry, Arc<TaskQueue>) {
    let queue = Arc::new(TaskQueue::manual());
    let registry = Registry::builder()
        .scheduler(queue.clone())
        .timeout_resolution(Duration::from_millis(50))
        .build();
    (registry, queue)
}

/// An atom whose every computation registers a finalizer bumping `finalized`.
fn tracked_resource(finalized: &Arc<AtomicU32>) -> Atom<u32> {
    let finalized = finalized.clone();
    Atom::readable(move |ctx: &Context<u32>| {
        let finalized = finalized.clone();
        ctx.add_finalizer(move || {
            finalized.fetch_add(1, Ordering::SeqCst);
        });
        7
    })
}

// ============================================================================
// Garbage collection
// ============================================================================

#[test]
fn unobserved_state_is_discarded() {
    let (registry, queue) = registry();
    let counter = Atom::make(1);
    registry.set(&counter, 5);
    assert_eq!(registry.get(&counter), 5);

    queue.run_until_idle();
    assert!(!registry.contains(&counter));
    assert_eq!(registry.get(&counter), 1);
}

#[test]
fn mounted_atoms_and_their_dependencies_survive() {
    let (registry, queue) = registry();
    let counter = Atom::make(1);
    let doubled = counter.map(|n| n * 2);
    let mount = registry.mount(&doubled);
    registry.set(&counter, 3);

    queue.run_until_idle();
    assert!(registry.contains(&counter));
    assert_eq!(registry.get(&doubled), 6);

    drop(mount);
    queue.run_until_idle();
    assert!(!registry.contains(&doubled));
    assert!(!registry.contains(&counter));
    assert_eq!(registry.node_count(), 0);
}

#[test]
fn keep_alive_nodes_are_never_collected() {
    let (registry, queue) = registry();
    let counter = Atom::make(1).keep_alive();
    registry.set(&counter, 5);
    queue.run_until_idle();
    queue.advance(Duration::from_secs(3600));
    assert_eq!(registry.get(&counter), 5);
}

#[test]
fn removal_runs_finalizers_once() {
    let (registry, queue) = registry();
    let finalized = Arc::new(AtomicU32::new(0));
    let resource = tracked_resource(&finalized);

    let mount = registry.mount(&resource);
    queue.run_until_idle();
    assert_eq!(finalized.load(Ordering::SeqCst), 0);

    drop(mount);
    queue.run_until_idle();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    queue.run_until_idle();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn recomputation_runs_previous_finalizers() {
    let (registry, _queue) = registry();
    let finalized = Arc::new(AtomicU32::new(0));
    let resource = tracked_resource(&finalized);
    let _mount = registry.mount(&resource);

    registry.refresh(&resource);
    registry.refresh(&resource);
    assert_eq!(finalized.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Idle TTL
// ============================================================================

#[test]
fn idle_ttl_keeps_state_until_it_elapses() {
    let (registry, queue) = registry();
    let counter = Atom::make(1).set_idle_ttl(Duration::from_millis(100));
    let mount = registry.mount(&counter);
    registry.set(&counter, 5);
    drop(mount);

    queue.run_until_idle();
    assert!(registry.contains(&counter));
    queue.advance(Duration::from_millis(50));
    assert!(registry.contains(&counter));

    queue.advance(Duration::from_millis(1000));
    assert!(!registry.contains(&counter));
    assert_eq!(registry.get(&counter), 1);
}

#[test]
fn resubscribing_within_the_window_revives_the_node() {
    let (registry, queue) = registry();
    let counter = Atom::make(1).set_idle_ttl(Duration::from_millis(100));
    let mount = registry.mount(&counter);
    registry.set(&counter, 5);
    drop(mount);
    queue.run_until_idle();

    let _again = registry.mount(&counter);
    queue.advance(Duration::from_secs(10));
    assert_eq!(registry.get(&counter), 5);
}

#[test]
fn default_idle_ttl_applies_to_every_atom() {
    let queue = Arc::new(TaskQueue::manual());
    let registry = Registry::builder()
        .scheduler(queue.clone())
        .default_idle_ttl(Duration::from_millis(200))
        .build();
    let counter = Atom::make(1);
    registry.set(&counter, 2);

    queue.run_until_idle();
    assert_eq!(queue.pending_timers(), 1);
    assert!(registry.contains(&counter));

    queue.advance(Duration::from_millis(400));
    assert!(!registry.contains(&counter));
}

#[test]
fn idle_timeouts_are_traced() {
    let queue = Arc::new(TaskQueue::manual());
    let collector = Arc::new(EventCollector::new());
    let registry = Registry::builder()
        .scheduler(queue.clone())
        .tracer(collector.clone())
        .timeout_resolution(Duration::from_millis(100))
        .build();
    let counter = Atom::make(1).set_idle_ttl(Duration::from_millis(150)).with_label("counter");
    registry.get(&counter);
    queue.run_until_idle();

    let scheduled: Vec<Duration> = collector
        .events()
        .into_iter()
        .filter_map(|event| match event {
            TraceEvent::IdleTimeoutScheduled { ttl, .. } => Some(ttl),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled, vec![Duration::from_millis(200)]);
}

// ============================================================================
// Disposal
// ============================================================================

#[test]
fn dispose_finalizes_every_node_once() {
    let (registry, _queue) = registry();
    let finalized = Arc::new(AtomicU32::new(0));
    let first = tracked_resource(&finalized);
    let second = tracked_resource(&finalized).keep_alive();
    let _mount = registry.mount(&first);
    registry.get(&second);

    registry.dispose();
    assert_eq!(finalized.load(Ordering::SeqCst), 2);
    assert_eq!(registry.node_count(), 0);

    registry.dispose();
    assert_eq!(finalized.load(Ordering::SeqCst), 2);
}

#[test]
fn registry_is_usable_after_dispose() {
    let (registry, _queue) = registry();
    let counter = Atom::make(1);
    registry.set(&counter, 9);
    registry.dispose();
    assert_eq!(registry.get(&counter), 1);
}

#[test]
fn node_lifecycle_is_traced() {
    let queue = Arc::new(TaskQueue::manual());
    let collector = Arc::new(EventCollector::new());
    let registry = Registry::builder()
        .scheduler(queue.clone())
        .tracer(collector.clone())
        .build();
    let counter = Atom::make(1).with_label("counter");
    registry.get(&counter);
    queue.run_until_idle();

    let events = collector.events();
    assert!(matches!(events.first(), Some(TraceEvent::NodeCreated { .. })));
    assert!(matches!(events.last(), Some(TraceEvent::NodeRemoved { .. })));
    assert_eq!(collector.compute_count("counter"), 1);
}

// ============================================================================
// Synchronous schedulers
// ============================================================================

/// Runs every task on the caller's stack, ignoring delays.
struct Immediate;

impl Scheduler for Immediate {
    fn schedule_task(&self, task: Task) {
        task();
    }

    fn schedule_timeout(&self, _delay: Duration, task: Task) {
        task();
    }

    fn now(&self) -> Duration {
        Duration::ZERO
    }
}

fn immediate_registry() -> Registry {
    Registry::builder().scheduler(Arc::new(Immediate)).build()
}

#[test]
fn synchronous_scheduler_collects_after_the_read() {
    let registry = immediate_registry();
    let counter = Atom::make(1);
    assert_eq!(registry.get(&counter), 1);
    assert!(!registry.contains(&counter));

    registry.set(&counter, 5);
    assert_eq!(registry.get(&counter), 1);
}

#[test]
fn synchronous_scheduler_keeps_observed_nodes() {
    let registry = immediate_registry();
    let counter = Atom::make(1);
    let doubled = counter.map(|n| n * 2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let sub = registry.subscribe(
        &doubled,
        move |value| log.lock().unwrap().push(value),
        SubscribeOptions::default(),
    );

    registry.set(&counter, 4);
    assert_eq!(registry.get(&doubled), 8);
    assert_eq!(*seen.lock().unwrap(), vec![8]);
    assert_eq!(registry.node_count(), 2);

    drop(sub);
    assert_eq!(registry.node_count(), 0);
}

#[test]
fn synchronous_scheduler_drives_effects() {
    let registry = immediate_registry();
    let (sender, receiver) = oneshot::channel::<u32>();
    let receiver = Mutex::new(Some(receiver));
    let user = Atom::effect(move |_| {
        let receiver = receiver.lock().unwrap().take();
        async move {
            match receiver {
                Some(receiver) => receiver.await.map_err(|_| "cancelled".to_string()),
                None => Err("rerun".to_string()),
            }
        }
    });
    let _mount = registry.mount(&user);
    assert_eq!(registry.get(&user), AsyncResult::initial(true));

    sender.send(3).unwrap();
    assert_eq!(registry.get(&user), AsyncResult::success(3));
}
