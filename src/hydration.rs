//! Snapshotting serializable atoms and restoring them into another registry.
//!
//! Only atoms marked with [`AtomRef::serializable`](crate::AtomRef::serializable)
//! take part. Values are encoded with `serde_json`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::atom::AtomDef;
use crate::error::AtomError;
use crate::node::{Listener, Value};
use crate::registry::{Registry, Subscription};
use crate::result::now_millis;
use crate::task::Spawned;

/// What [`dehydrate`] does with atoms whose value is an `Initial` result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodeInitialAs {
    /// Leave them out of the snapshot.
    #[default]
    Ignore,
    /// Include the `Initial` value as is.
    ValueOnly,
    /// Include the `Initial` value and a promise of the first settled value.
    Promise,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DehydrateOptions {
    pub encode_initial_as: EncodeInitialAs,
}

/// Resolves with the encoded settled value of an atom that was `Initial`
/// when it was dehydrated, or `None` if it never settled.
#[derive(Clone)]
pub struct ResultPromise(Shared<BoxFuture<'static, Option<serde_json::Value>>>);

impl Future for ResultPromise {
    type Output = Option<serde_json::Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx)
    }
}

impl fmt::Debug for ResultPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResultPromise").finish()
    }
}

/// One entry of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DehydratedAtom {
    pub key: String,
    pub value: serde_json::Value,
    /// Milliseconds since the Unix epoch when the snapshot was taken.
    pub dehydrated_at: u64,
    #[serde(skip)]
    pub result_promise: Option<ResultPromise>,
}

fn is_initial(encoded: &serde_json::Value) -> bool {
    encoded.get("_tag").and_then(serde_json::Value::as_str) == Some("Initial")
}

/// Snapshot every serializable atom that currently holds a value.
///
/// If any value fails to encode the error is reported to the tracer and the
/// snapshot is empty.
pub fn dehydrate(registry: &Registry, options: DehydrateOptions) -> Vec<DehydratedAtom> {
    let _guard = registry.exclusive();
    let dehydrated_at = now_millis();
    let mut snapshot = Vec::new();
    for (def, value) in registry.serializable_values() {
        let Some(codec) = def.codec.clone() else {
            continue;
        };
        let value = match (codec.encode)(&value) {
            Ok(value) => value,
            Err(error) => {
                registry
                    .tracer()
                    .on_hydration_error(&codec.key, &error.to_string());
                return Vec::new();
            }
        };
        let initial = codec.async_result && is_initial(&value);
        let result_promise = match (initial, options.encode_initial_as) {
            (true, EncodeInitialAs::Ignore) => continue,
            (true, EncodeInitialAs::Promise) => Some(settled_value(registry, &def)),
            _ => None,
        };
        snapshot.push(DehydratedAtom {
            key: codec.key.to_string(),
            value,
            dehydrated_at,
            result_promise,
        });
    }
    snapshot
}

/// Subscribe to `def` until it holds something other than `Initial`.
fn settled_value(registry: &Registry, def: &Arc<AtomDef>) -> ResultPromise {
    let (sender, receiver) = oneshot::channel();
    let sender = Mutex::new(Some(sender));
    let subscription: Arc<Mutex<Option<Subscription>>> = Arc::default();
    let codec = def.codec.clone();
    let held = subscription.clone();
    let listener: Listener = Arc::new(move |value: &Value| {
        let Some(encoded) = codec.as_ref().and_then(|codec| (codec.encode)(value).ok()) else {
            return;
        };
        if is_initial(&encoded) {
            return;
        }
        if let Some(sender) = sender.lock().take() {
            let _ = sender.send(encoded);
        }
        let finished = held.lock().take();
        drop(finished);
    });
    *subscription.lock() = Some(registry.subscribe_erased(def, listener, false));
    ResultPromise(receiver.map(Result::ok).boxed().shared())
}

/// Entries of a snapshot whose atoms already had nodes in the registry.
///
/// Returned by [`hydrate`] so the caller chooses when to overwrite live
/// state.
#[derive(Debug, Default)]
#[must_use = "existing atoms are only updated once the hydration is committed"]
pub struct Hydration {
    existing: Vec<DehydratedAtom>,
}

impl Hydration {
    pub fn existing(&self) -> &[DehydratedAtom] {
        &self.existing
    }

    pub fn is_empty(&self) -> bool {
        self.existing.is_empty()
    }

    /// Write the staged entries into their nodes in one batch.
    ///
    /// Every entry is attempted; the first decoding error is returned.
    pub fn commit(self, registry: &Registry) -> Result<(), AtomError> {
        registry.batch(|| {
            let mut first_error = None;
            for entry in self.existing {
                if let Err(error) = registry.apply_encoded(&entry.key, entry.value) {
                    first_error.get_or_insert(error);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }
}

/// Restore a snapshot into `registry`.
///
/// Values for atoms without a node are preloaded and decoded when the node
/// is created. Entries for atoms that already have a node are staged in the
/// returned [`Hydration`], unless the node's value is newer than the
/// snapshot. Promises are awaited on the registry's scheduler and applied
/// when they resolve.
pub fn hydrate(registry: &Registry, snapshot: impl IntoIterator<Item = DehydratedAtom>) -> Hydration {
    let _guard = registry.exclusive();
    let mut existing = Vec::new();
    for mut entry in snapshot {
        let promise = entry.result_promise.take();
        let key = entry.key.clone();
        match registry.serializable_node(&entry.key) {
            None => registry.preload(&entry.key, entry.value),
            Some((_, updated_at)) => {
                if updated_at.map_or(true, |updated_at| entry.dehydrated_at > updated_at) {
                    existing.push(entry);
                }
            }
        }
        if let Some(promise) = promise {
            let target = registry.downgrade();
            Spawned::spawn(registry.scheduler().clone(), async move {
                let Some(value) = promise.await else {
                    return;
                };
                if let Some(registry) = target.upgrade() {
                    // Decoding errors were already reported to the tracer.
                    let _ = registry.apply_encoded(&key, value);
                }
            });
        }
    }
    Hydration { existing }
}
