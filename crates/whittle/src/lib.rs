//! Engine for minimizing failure-inducing inputs of external command-line
//! tools.
//!
//! Given an initial problem instance that exhibits some property of interest
//! (a bug, a discrepancy between two algorithms, a performance anomaly), the
//! engine searches for a smaller instance that still exhibits the property.
//! It repeatedly applies caller-supplied reduction transformations
//! ([`SuccessorGenerator`]s) and judges each candidate with an external
//! *evaluator* program, committing to the first candidate the evaluator
//! accepts and restarting the reductions from the top.
//!
//! Evaluation is delegated to an [`Environment`]: the [`LocalEnvironment`]
//! runs candidates sequentially on the local machine, while the
//! [`SlurmEnvironment`] evaluates whole batches in parallel on the compute
//! nodes of a cluster, with the search itself running on the login node.
//!
//! States are opaque to the engine: anything serializable can be minimized.
//! Only the successor generators and the evaluator interpret the contents of
//! a state.

pub mod config;
mod environment;
mod error;
mod evaluator;
mod process;
mod search;
mod store;
mod successors;

pub use environment::*;
pub use error::*;
pub use evaluator::*;
pub use process::*;
pub use search::*;
pub use store::*;
pub use successors::*;
