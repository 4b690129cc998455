//! Error types for misuse of the atom graph and for hydration.

/// Errors raised by the registry itself, as opposed to failures of an atom's
/// own computation (those are captured in [`AsyncResult::Failure`](crate::AsyncResult)).
///
/// A cycle or a type mismatch is a static programming error: the registry
/// panics with the error itself as payload instead of returning it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AtomError {
    /// An atom (transitively) read itself while it was being computed.
    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    Cycle {
        /// Debug representation of the atoms forming the cycle.
        path: Vec<String>,
    },

    /// `get_or_throw` was called on a result that has no value yet.
    #[error("result has no value yet")]
    NoValue,

    /// A stream completed without ever emitting an item.
    #[error("stream completed without emitting a value")]
    EmptyStream,

    /// Two atoms with different value types resolved to the same node.
    #[error("atom `{key}` holds a value of a different type than requested")]
    TypeMismatch {
        /// The node key that was shared.
        key: String,
    },

    /// A serializable atom could not be encoded or decoded.
    #[error("failed to encode or decode serializable atom `{key}`: {message}")]
    Serialization {
        /// The serializable key.
        key: String,
        /// The underlying codec error.
        message: String,
    },
}
