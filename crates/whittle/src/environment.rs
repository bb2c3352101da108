//! Evaluation environments.
//!
//! An environment decides how a batch of successors is evaluated: the
//! [`LocalEnvironment`] runs evaluations sequentially on the local machine,
//! the [`SlurmEnvironment`] dispatches each batch as one array job to the
//! compute nodes of a cluster. The search driver only sees the three-phase
//! contract of the [`Environment`] trait and treats every batch as a single
//! blocking step.

use std::path::Path;

use futures::future::BoxFuture;

use crate::Error;
use crate::Result;
use crate::State;
use crate::Successor;

mod local;
mod slurm;

pub use local::*;
pub use slurm::*;

/// Options shared by all evaluation environments.
#[derive(Debug, Clone)]
pub struct EnvironmentOptions {
    /// The maximum number of successors evaluated per batch.
    pub batch_size: usize,

    /// Governs the commit policy under parallel evaluation.
    ///
    /// Results of parallel evaluations do not necessarily arrive in
    /// submission order: for successors `[s1, s2, s3]`, a positive verdict
    /// for `s3` can be available before any verdict for `s1`, and a crash
    /// of `s2` would have prevented a sequential evaluation from ever
    /// reaching `s3`. With nondeterministic choice (the default) the search
    /// commits to the first successfully evaluated successor even if a
    /// sequential evaluation would have committed to an earlier one.
    ///
    /// Switching this off makes the search simulate sequential execution:
    /// the lowest-indexed success wins, committed only once every
    /// earlier-indexed task has a settled verdict, and failures that a
    /// sequential run would have tripped over become fatal.
    pub allow_nondeterministic_successor_choice: bool,
}

impl EnvironmentOptions {
    /// Creates options with the given batch size and nondeterministic
    /// successor choice.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            allow_nondeterministic_successor_choice: true,
        }
    }

    /// Checks the options for fatal misconfigurations.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Configuration(
                "batch size must be at least one".into(),
            ));
        }

        Ok(())
    }
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self::new(1)
    }
}

/// The three-phase contract between the search and an evaluation backend.
///
/// A batch moves through a strict submit → wait → collect cycle:
///
/// 1. [`submit`](Self::submit) begins evaluating a batch of successors.
/// 2. [`wait_until_finished`](Self::wait_until_finished) blocks until enough
///    verdicts are available: either a successor the search should commit
///    to, or negative verdicts for the whole batch.
/// 3. [`get_improving_successor`](Self::get_improving_successor) returns the
///    winner, if any, and releases the batch.
///
/// Calling a phase out of order is a programming error and panics. Fatal
/// conditions (see [`Error`](crate::Error)) surface as `Err` from the phase
/// that detected them and abort the search.
pub trait Environment<S: State>: Send {
    /// The maximum number of successors per submitted batch.
    fn batch_size(&self) -> usize;

    /// Begins evaluating *batch* with the evaluator program at *evaluator*.
    ///
    /// # Panics
    ///
    /// Panics if a batch is already in flight, if *batch* is empty, or if it
    /// exceeds [`batch_size`](Self::batch_size).
    fn submit<'a>(
        &'a mut self,
        batch: Vec<Successor<S>>,
        evaluator: &'a Path,
    ) -> BoxFuture<'a, Result<()>>;

    /// Blocks until a verdict for the batch in flight can be returned.
    ///
    /// # Panics
    ///
    /// Panics if no batch is in flight or the batch was already waited for.
    fn wait_until_finished(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Returns the successor the search should commit to, if any, and
    /// releases the batch.
    ///
    /// # Panics
    ///
    /// Panics if no batch is in flight or it has not been waited for.
    fn get_improving_successor(&mut self) -> BoxFuture<'_, Result<Option<Successor<S>>>>;
}
