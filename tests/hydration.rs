//! Dehydrating serializable atoms and hydrating them into another registry.

use atom_flow::{
    dehydrate, hydrate, now_millis, AsyncResult, Atom, AtomError, AtomRef, DehydrateOptions,
    DehydratedAtom, EncodeInitialAs, EventCollector, Registry, TaskQueue, TraceEvent,
};
use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

fn registry() -> (Registry, Arc<TaskQueue>) {
    let queue = Arc::new(TaskQueue::manual());
    let registry = Registry::builder().scheduler(queue.clone()).build();
    (registry, queue)
}

fn entry(key: &str, value: serde_json::Value, dehydrated_at: u64) -> DehydratedAtom {
    DehydratedAtom {
        key: key.to_string(),
        value,
        dehydrated_at,
        result_promise: None,
    }
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn values_round_trip_between_registries() {
    let (server, _sq) = registry();
    let (client, _cq) = registry();
    let count = Atom::make(0).serializable("count");
    server.set(&count, 7);

    let snapshot = dehydrate(&server, DehydrateOptions::default());
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].key, "count");
    assert_eq!(snapshot[0].value, json!(7));

    let hydration = hydrate(&client, snapshot);
    assert!(hydration.is_empty());
    assert_eq!(client.get(&count), 7);
}

#[test]
fn snapshots_survive_json_transport() {
    let (server, _sq) = registry();
    let (client, _cq) = registry();
    let names = Atom::make(vec!["a".to_string()]).serializable("names");
    server.set(&names, vec!["b".to_string(), "c".to_string()]);

    let wire = serde_json::to_string(&dehydrate(&server, DehydrateOptions::default())).unwrap();
    let snapshot: Vec<DehydratedAtom> = serde_json::from_str(&wire).unwrap();
    let _ = hydrate(&client, snapshot);

    // A separately constructed atom with the same key reads the same node.
    let same_key = Atom::make(Vec::<String>::new()).serializable("names");
    assert_eq!(client.get(&same_key), vec!["b", "c"]);
}

#[test]
fn only_serializable_atoms_are_dehydrated() {
    let (server, _sq) = registry();
    let private = Atom::make(1);
    let public = Atom::make(2).serializable("public");
    server.get(&private);
    server.get(&public);

    let keys: Vec<String> = dehydrate(&server, DehydrateOptions::default())
        .into_iter()
        .map(|entry| entry.key)
        .collect();
    assert_eq!(keys, vec!["public"]);
}

#[test]
fn hydrating_twice_is_a_no_op() {
    let (server, _sq) = registry();
    let (client, _cq) = registry();
    let count = Atom::make(0).serializable("count");
    server.set(&count, 3);
    let snapshot = dehydrate(&server, DehydrateOptions::default());

    let _ = hydrate(&client, snapshot.clone());
    assert_eq!(client.get(&count), 3);
    let second = hydrate(&client, snapshot);
    assert!(second.is_empty());
    assert_eq!(client.get(&count), 3);
}

// ============================================================================
// Existing nodes
// ============================================================================

#[test]
fn newer_entries_for_existing_nodes_wait_for_commit() {
    let (client, _cq) = registry();
    let count = Atom::make(0).serializable("count");
    assert_eq!(client.get(&count), 0);

    let hydration = hydrate(&client, vec![entry("count", json!(9), now_millis() + 60_000)]);
    assert_eq!(hydration.existing().len(), 1);
    assert_eq!(client.get(&count), 0);

    hydration.commit(&client).unwrap();
    assert_eq!(client.get(&count), 9);
}

#[test]
fn older_entries_do_not_overwrite_live_state() {
    let (client, _cq) = registry();
    let count = Atom::make(0).serializable("count");
    client.set(&count, 4);

    let hydration = hydrate(&client, vec![entry("count", json!(9), 0)]);
    assert!(hydration.is_empty());
    assert_eq!(client.get(&count), 4);
}

#[test]
fn commit_reports_undecodable_entries() {
    let (client, _cq) = registry();
    let count = Atom::make(0).serializable("count");
    client.get(&count);

    let hydration = hydrate(
        &client,
        vec![entry("count", json!("nine"), now_millis() + 60_000)],
    );
    match hydration.commit(&client) {
        Err(AtomError::Serialization { key, .. }) => assert_eq!(key, "count"),
        other => panic!("expected a serialization error, got {other:?}"),
    }
    assert_eq!(client.get(&count), 0);
}

// ============================================================================
// Async results
// ============================================================================

/// A serializable effect atom and the sender that settles it.
fn pending_user() -> (
    Atom<AsyncResult<u32, String>>,
    oneshot::Sender<u32>,
) {
    let (sender, receiver) = oneshot::channel::<u32>();
    let receiver = Mutex::new(Some(receiver));
    let user = Atom::effect(move |_| {
        let receiver = receiver.lock().unwrap().take();
        async move {
            match receiver {
                Some(receiver) => receiver.await.map_err(|_| "cancelled".to_string()),
                None => Err("already requested".to_string()),
            }
        }
    })
    .serializable("user");
    (user, sender)
}

#[test]
fn initial_results_are_skipped_by_default() {
    let (server, _sq) = registry();
    let (user, _sender) = pending_user();
    let _mount = server.mount(&user);
    assert!(dehydrate(&server, DehydrateOptions::default()).is_empty());

    let snapshot = dehydrate(
        &server,
        DehydrateOptions {
            encode_initial_as: EncodeInitialAs::ValueOnly,
        },
    );
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].value["_tag"], "Initial");
    assert!(snapshot[0].result_promise.is_none());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Stage {
    #[serde(rename = "_tag")]
    tag: String,
}

#[test]
fn plain_values_tagged_initial_are_still_dehydrated() {
    let (server, _sq) = registry();
    let stage = Atom::make(Stage {
        tag: "Initial".to_string(),
    })
    .serializable("stage");
    server.get(&stage);

    let snapshot = dehydrate(&server, DehydrateOptions::default());
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].value, json!({"_tag": "Initial"}));
    assert!(snapshot[0].result_promise.is_none());
}

#[test]
fn promised_results_are_applied_when_they_settle() {
    let (server, server_queue) = registry();
    let (client, client_queue) = registry();
    let (user, sender) = pending_user();
    let _server_mount = server.mount(&user);

    let snapshot = dehydrate(
        &server,
        DehydrateOptions {
            encode_initial_as: EncodeInitialAs::Promise,
        },
    );
    assert!(snapshot[0].result_promise.is_some());

    let _ = hydrate(&client, snapshot);
    let _client_mount = client.mount(&user);
    assert!(client.get(&user).is_initial());

    sender.send(5).unwrap();
    server_queue.run_until_idle();
    client_queue.run_until_idle();
    assert_eq!(client.get(&user), AsyncResult::success(5));
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn encoding_errors_yield_an_empty_snapshot() {
    let queue = Arc::new(TaskQueue::manual());
    let collector = Arc::new(EventCollector::new());
    let server = Registry::builder()
        .scheduler(queue)
        .tracer(collector.clone())
        .build();
    let fine = Atom::make(1).serializable("fine");
    // Tuple keys have no JSON object representation.
    let broken = Atom::make(BTreeMap::from([((1u8, 2u8), 3u8)])).serializable("broken");
    server.get(&fine);
    server.get(&broken);

    assert!(dehydrate(&server, DehydrateOptions::default()).is_empty());
    assert!(collector
        .events()
        .iter()
        .any(|event| matches!(event, TraceEvent::HydrationError { key, .. } if key == "broken")));
    assert_eq!(broken.serializable_key(), Some("broken"));
}
