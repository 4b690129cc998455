//! Tri-state results for values that may be produced asynchronously.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AtomError;

/// Milliseconds since the Unix epoch, used to stamp successes and snapshots.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Why a computation did not produce a value.
#[derive(Debug, Clone)]
pub enum Cause<E> {
    /// An expected, typed failure.
    Fail(E),
    /// An unexpected defect, such as a panic inside an effect.
    Die(Arc<anyhow::Error>),
    /// The computation was cancelled before it finished.
    Interrupt,
}

impl<E> Cause<E> {
    /// Wraps an arbitrary error as a defect.
    pub fn die(error: impl Into<anyhow::Error>) -> Self {
        Cause::Die(Arc::new(error.into()))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Cause::Interrupt)
    }

    pub fn is_die(&self) -> bool {
        matches!(self, Cause::Die(_))
    }

    /// The typed failure, if this cause carries one.
    pub fn failure(&self) -> Option<&E> {
        match self {
            Cause::Fail(error) => Some(error),
            _ => None,
        }
    }

    pub fn map<E2>(self, f: impl FnOnce(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Fail(error) => Cause::Fail(f(error)),
            Cause::Die(defect) => Cause::Die(defect),
            Cause::Interrupt => Cause::Interrupt,
        }
    }
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Fail(error) => write!(f, "{error}"),
            Cause::Die(defect) => write!(f, "defect: {defect}"),
            Cause::Interrupt => write!(f, "interrupted"),
        }
    }
}

// Defects compare by message so that decoded snapshots compare equal to the
// values they were encoded from.
impl<E: PartialEq> PartialEq for Cause<E> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cause::Fail(a), Cause::Fail(b)) => a == b,
            (Cause::Die(a), Cause::Die(b)) => Arc::ptr_eq(a, b) || a.to_string() == b.to_string(),
            (Cause::Interrupt, Cause::Interrupt) => true,
            _ => false,
        }
    }
}

impl<E: Eq> Eq for Cause<E> {}

impl<E: Hash> Hash for Cause<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Cause::Fail(error) => error.hash(state),
            Cause::Die(defect) => defect.to_string().hash(state),
            Cause::Interrupt => {}
        }
    }
}

impl<E: Serialize> Serialize for Cause<E> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(tag = "_tag")]
        enum Encoded<'a, E> {
            Fail { error: &'a E },
            Die { defect: String },
            Interrupt,
        }

        let encoded = match self {
            Cause::Fail(error) => Encoded::Fail { error },
            Cause::Die(defect) => Encoded::Die {
                defect: defect.to_string(),
            },
            Cause::Interrupt => Encoded::Interrupt,
        };
        encoded.serialize(serializer)
    }
}

impl<'de, E: Deserialize<'de>> Deserialize<'de> for Cause<E> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(tag = "_tag")]
        enum Encoded<E> {
            Fail { error: E },
            Die { defect: String },
            Interrupt,
        }

        Ok(match Encoded::deserialize(deserializer)? {
            Encoded::Fail { error } => Cause::Fail(error),
            Encoded::Die { defect } => Cause::Die(Arc::new(anyhow::anyhow!(defect))),
            Encoded::Interrupt => Cause::Interrupt,
        })
    }
}

/// The last success a failure was preceded by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviousSuccess<A> {
    pub value: A,
    pub timestamp: u64,
}

impl<A: PartialEq> PartialEq for PreviousSuccess<A> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<A: Eq> Eq for PreviousSuccess<A> {}

impl<A> PreviousSuccess<A> {
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> PreviousSuccess<B> {
        PreviousSuccess {
            value: f(self.value),
            timestamp: self.timestamp,
        }
    }
}

/// State of an asynchronously produced value.
///
/// Every variant carries a `waiting` flag: a `Success` that is `waiting` is a
/// stale value while a newer one is being computed. Equality ignores the
/// success timestamp, so recomputing the same value does not notify
/// subscribers, but a change of `waiting` does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum AsyncResult<A, E> {
    Initial {
        waiting: bool,
    },
    Success {
        value: A,
        timestamp: u64,
        waiting: bool,
    },
    Failure {
        cause: Cause<E>,
        previous_success: Option<PreviousSuccess<A>>,
        waiting: bool,
    },
}

impl<A, E> Default for AsyncResult<A, E> {
    fn default() -> Self {
        AsyncResult::Initial { waiting: false }
    }
}

impl<A: PartialEq, E: PartialEq> PartialEq for AsyncResult<A, E> {
    fn eq(&self, other: &Self) -> bool {
        use AsyncResult::*;
        match (self, other) {
            (Initial { waiting: a }, Initial { waiting: b }) => a == b,
            (
                Success {
                    value: a,
                    waiting: wa,
                    ..
                },
                Success {
                    value: b,
                    waiting: wb,
                    ..
                },
            ) => wa == wb && a == b,
            (
                Failure {
                    cause: a,
                    previous_success: pa,
                    waiting: wa,
                },
                Failure {
                    cause: b,
                    previous_success: pb,
                    waiting: wb,
                },
            ) => wa == wb && a == b && pa == pb,
            _ => false,
        }
    }
}

impl<A: Eq, E: Eq> Eq for AsyncResult<A, E> {}

impl<A: Hash, E: Hash> Hash for AsyncResult<A, E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            AsyncResult::Initial { waiting } => waiting.hash(state),
            AsyncResult::Success { value, waiting, .. } => {
                value.hash(state);
                waiting.hash(state);
            }
            AsyncResult::Failure {
                cause,
                previous_success,
                waiting,
            } => {
                cause.hash(state);
                previous_success.as_ref().map(|p| &p.value).hash(state);
                waiting.hash(state);
            }
        }
    }
}

impl<A, E> AsyncResult<A, E> {
    pub const fn initial(waiting: bool) -> Self {
        AsyncResult::Initial { waiting }
    }

    /// A settled success stamped with the current time.
    pub fn success(value: A) -> Self {
        AsyncResult::Success {
            value,
            timestamp: now_millis(),
            waiting: false,
        }
    }

    pub fn success_with(value: A, waiting: bool) -> Self {
        AsyncResult::Success {
            value,
            timestamp: now_millis(),
            waiting,
        }
    }

    /// A settled success recorded at `timestamp` (milliseconds since the Unix epoch).
    pub fn success_at(value: A, timestamp: u64) -> Self {
        AsyncResult::Success {
            value,
            timestamp,
            waiting: false,
        }
    }

    pub fn fail(error: E) -> Self {
        Self::failure(Cause::Fail(error))
    }

    pub fn failure(cause: Cause<E>) -> Self {
        AsyncResult::Failure {
            cause,
            previous_success: None,
            waiting: false,
        }
    }

    /// A failure that remembers the last success of `previous`, if any.
    pub fn failure_with_previous(cause: Cause<E>, previous: Option<&Self>) -> Self
    where
        A: Clone,
    {
        AsyncResult::Failure {
            cause,
            previous_success: previous.and_then(Self::previous_success),
            waiting: false,
        }
    }

    /// A settled result for a finished computation.
    pub fn from_exit_with_previous(exit: Result<A, Cause<E>>, previous: Option<&Self>) -> Self
    where
        A: Clone,
    {
        match exit {
            Ok(value) => Self::success(value),
            Err(cause) => Self::failure_with_previous(cause, previous),
        }
    }

    /// The same result, marked as waiting for a newer value.
    pub fn waiting(self) -> Self {
        self.with_waiting(true)
    }

    pub fn with_waiting(mut self, flag: bool) -> Self {
        match &mut self {
            AsyncResult::Initial { waiting }
            | AsyncResult::Success { waiting, .. }
            | AsyncResult::Failure { waiting, .. } => *waiting = flag,
        }
        self
    }

    /// The result to show while recomputing: `previous` marked waiting, or a
    /// waiting `Initial` when there is nothing to show yet.
    pub fn waiting_from(previous: Option<Self>) -> Self {
        match previous {
            Some(previous) => previous.waiting(),
            None => AsyncResult::Initial { waiting: true },
        }
    }

    pub fn is_initial(&self) -> bool {
        matches!(self, AsyncResult::Initial { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AsyncResult::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, AsyncResult::Failure { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, AsyncResult::Failure { cause, .. } if cause.is_interrupted())
    }

    pub fn is_waiting(&self) -> bool {
        match self {
            AsyncResult::Initial { waiting }
            | AsyncResult::Success { waiting, .. }
            | AsyncResult::Failure { waiting, .. } => *waiting,
        }
    }

    pub fn timestamp(&self) -> Option<u64> {
        match self {
            AsyncResult::Success { timestamp, .. } => Some(*timestamp),
            AsyncResult::Failure {
                previous_success, ..
            } => previous_success.as_ref().map(|p| p.timestamp),
            AsyncResult::Initial { .. } => None,
        }
    }

    /// The current value, or the value preceding a failure.
    pub fn value(&self) -> Option<&A> {
        match self {
            AsyncResult::Success { value, .. } => Some(value),
            AsyncResult::Failure {
                previous_success, ..
            } => previous_success.as_ref().map(|p| &p.value),
            AsyncResult::Initial { .. } => None,
        }
    }

    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            AsyncResult::Failure { cause, .. } => Some(cause),
            _ => None,
        }
    }

    pub fn previous_success(&self) -> Option<PreviousSuccess<A>>
    where
        A: Clone,
    {
        match self {
            AsyncResult::Success {
                value, timestamp, ..
            } => Some(PreviousSuccess {
                value: value.clone(),
                timestamp: *timestamp,
            }),
            AsyncResult::Failure {
                previous_success, ..
            } => previous_success.clone(),
            AsyncResult::Initial { .. } => None,
        }
    }

    pub fn get_or_else(&self, fallback: impl FnOnce() -> A) -> A
    where
        A: Clone,
    {
        self.value().cloned().unwrap_or_else(fallback)
    }

    /// The success value, the failure's cause, or a `NoValue` defect.
    pub fn get_or_throw(&self) -> Result<A, Cause<E>>
    where
        A: Clone,
        E: Clone,
    {
        match self {
            AsyncResult::Success { value, .. } => Ok(value.clone()),
            AsyncResult::Failure { cause, .. } => Err(cause.clone()),
            AsyncResult::Initial { .. } => Err(Cause::die(AtomError::NoValue)),
        }
    }

    /// The settled outcome, or `None` while `Initial`.
    pub fn into_exit(self) -> Option<Result<A, Cause<E>>> {
        match self {
            AsyncResult::Success { value, .. } => Some(Ok(value)),
            AsyncResult::Failure { cause, .. } => Some(Err(cause)),
            AsyncResult::Initial { .. } => None,
        }
    }

    pub fn match_with<R>(
        &self,
        on_initial: impl FnOnce(bool) -> R,
        on_success: impl FnOnce(&A, bool) -> R,
        on_failure: impl FnOnce(&Cause<E>, bool) -> R,
    ) -> R {
        match self {
            AsyncResult::Initial { waiting } => on_initial(*waiting),
            AsyncResult::Success { value, waiting, .. } => on_success(value, *waiting),
            AsyncResult::Failure { cause, waiting, .. } => on_failure(cause, *waiting),
        }
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> AsyncResult<B, E> {
        match self {
            AsyncResult::Initial { waiting } => AsyncResult::Initial { waiting },
            AsyncResult::Success {
                value,
                timestamp,
                waiting,
            } => AsyncResult::Success {
                value: f(value),
                timestamp,
                waiting,
            },
            AsyncResult::Failure {
                cause,
                previous_success,
                waiting,
            } => AsyncResult::Failure {
                cause,
                previous_success: previous_success.map(|p| p.map(f)),
                waiting,
            },
        }
    }

    pub fn map_err<E2>(self, f: impl FnOnce(E) -> E2) -> AsyncResult<A, E2> {
        match self {
            AsyncResult::Initial { waiting } => AsyncResult::Initial { waiting },
            AsyncResult::Success {
                value,
                timestamp,
                waiting,
            } => AsyncResult::Success {
                value,
                timestamp,
                waiting,
            },
            AsyncResult::Failure {
                cause,
                previous_success,
                waiting,
            } => AsyncResult::Failure {
                cause: cause.map(f),
                previous_success,
                waiting,
            },
        }
    }
}
