//! Error kinds raised by the search engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised while driving the search.
///
/// The distinction between the variants matters for recovery: with
/// nondeterministic successor choice, a [`Submission`](Self::Submission)
/// failure skips the affected batch and a
/// [`FilesystemTimeout`](Self::FilesystemTimeout) skips the affected task,
/// while deterministic successor choice treats both as fatal. Every other
/// kind aborts the search.
#[derive(Debug, Error)]
pub enum Error {
    /// The batch scheduler rejected a submission, printed no job id, or a
    /// run directory could not be materialized.
    #[error("job submission failed: {0}")]
    Submission(String),

    /// The batch scheduler status query failed or printed malformed output.
    #[error("polling the batch scheduler failed: {0}")]
    Polling(String),

    /// The evaluator could not be executed, or a task ended in a critical
    /// scheduler state the search cannot recover from.
    #[error("evaluation failed: {0}")]
    Evaluator(String),

    /// An expected file never appeared on the shared filesystem.
    #[error("`{}` did not appear on the shared filesystem within {limit} seconds", .path.display())]
    FilesystemTimeout {
        /// The path that was still missing when the limit ran out.
        path: PathBuf,
        /// The applied limit in seconds.
        limit: u64,
    },

    /// The environment is misconfigured; reported before any job runs.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// An I/O operation failed.
    #[error("{context}: {source}")]
    Io {
        /// What the engine was doing when the operation failed.
        context: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A state could not be serialized or deserialized.
    #[error("{context}: {source}")]
    State {
        /// What the engine was doing when the conversion failed.
        context: String,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Wraps an I/O error with a description of the failed operation.
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wraps a serialization error with a description of the failed
    /// operation.
    pub(crate) fn state(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::State {
            context: context.into(),
            source,
        }
    }
}
