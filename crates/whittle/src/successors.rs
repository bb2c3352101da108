//! Successor generation.
//!
//! Reductions are expressed as successor generators: given the current
//! state, a generator produces a lazy stream of candidate states that are
//! smaller or simpler in some domain-specific sense. What "smaller" means is
//! entirely up to the generator; the engine only consumes the stream.

use crate::State;

/// A candidate state produced by applying one reduction to a state.
#[derive(Debug, Clone)]
pub struct Successor<S> {
    /// The reduced state.
    pub state: S,
    /// A human-readable description of the applied change.
    pub change: String,
}

impl<S> Successor<S> {
    /// Creates a successor from a reduced state and a description of the
    /// change, e.g. `"removed object package-7"`.
    pub fn new(state: S, change: impl Into<String>) -> Self {
        Self {
            state,
            change: change.into(),
        }
    }
}

/// A lazy, finite, forward-only stream of successors.
pub type SuccessorIter<'a, S> = Box<dyn Iterator<Item = Successor<S>> + Send + 'a>;

/// A reduction strategy producing successors of a state.
///
/// Generators are stateless factories: every call to
/// [`successors`](Self::successors) starts a fresh pass over the given
/// state. The engine consumes at most one pass per state and abandons the
/// stream early as soon as an earlier candidate of the pass is accepted, so
/// implementations must not rely on being driven to exhaustion.
///
/// The engine does not assume any ordering beyond what the generator itself
/// documents; it evaluates candidates in stream order and commits according
/// to the environment's successor-choice policy.
pub trait SuccessorGenerator<S: State>: Send + Sync {
    /// Returns the stream of successors of *state*.
    fn successors<'a>(&'a self, state: &'a S) -> SuccessorIter<'a, S>;
}
