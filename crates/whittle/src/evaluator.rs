//! Invoking evaluators and classifying their verdicts.
//!
//! An evaluator is an external program that decides whether a candidate
//! state still exhibits the property of interest. It is invoked with the
//! path of a serialized state as its sole argument and communicates its
//! verdict through its exit code.

use std::fmt;
use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use tracing::warn;

use crate::Error;
use crate::Result;
use crate::RunOutput;
use crate::State;
use crate::run_with_limits;
use crate::store;

/// Exit code an evaluator reports when the evaluation ran out of CPU time.
///
/// Reserved: the engine classifies this code as [`Outcome::Timeout`] rather
/// than as an ordinary negative verdict.
pub const EXIT_CODE_TIMEOUT: i32 = 200;

/// Exit code an evaluator reports when the evaluation ran out of memory.
///
/// Reserved: the engine classifies this code as [`Outcome::Memout`] rather
/// than as an ordinary negative verdict.
pub const EXIT_CODE_MEMOUT: i32 = 201;

/// The verdict of evaluating a single successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The state retains the property of interest; the search commits to it.
    Success,
    /// The state no longer exhibits the property of interest.
    Failure,
    /// The evaluation exceeded its CPU-time limit.
    Timeout,
    /// The evaluation exceeded its address-space limit.
    Memout,
    /// The evaluator could not be run or died with an unrelated signal.
    Error,
}

impl Outcome {
    /// Whether the search should commit to the evaluated successor.
    ///
    /// Only [`Success`](Self::Success) commits; every other outcome counts
    /// as a negative verdict for its successor and never aborts the batch.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Timeout => write!(f, "timeout"),
            Self::Memout => write!(f, "memout"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Classifies an exit code reported by an evaluator.
pub fn classify_exit_code(code: i32) -> Outcome {
    match code {
        0 => Outcome::Success,
        EXIT_CODE_TIMEOUT => Outcome::Timeout,
        EXIT_CODE_MEMOUT => Outcome::Memout,
        _ => Outcome::Failure,
    }
}

/// Classifies the exit status of a locally spawned evaluator.
///
/// Termination by one of the resource-limit signals (`SIGXCPU` at the soft
/// CPU limit, `SIGKILL` at the hard one) counts as a timeout, so evaluators
/// killed by the kernel are not mistaken for crashes.
pub fn classify_exit_status(status: ExitStatus) -> Outcome {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            return if signal == libc::SIGXCPU || signal == libc::SIGKILL {
                Outcome::Timeout
            } else {
                Outcome::Error
            };
        }
    }

    match status.code() {
        Some(code) => classify_exit_code(code),
        None => Outcome::Error,
    }
}

/// Evaluates *state* with the evaluator program at *evaluator*.
///
/// The state is written to a fresh temporary directory and the evaluator is
/// spawned with the state file as its sole argument, under the given
/// CPU-time and address-space limits (see
/// [`run_with_limits`](crate::run_with_limits)).
///
/// A missing evaluator executable is an error and aborts the search; any
/// other failure to run the evaluator is that successor's problem and maps
/// to [`Outcome::Error`].
pub async fn evaluate<S: State>(
    evaluator: &Path,
    state: &S,
    time_limit: Option<Duration>,
    memory_limit: Option<u64>,
) -> Result<Outcome> {
    let dir = tempfile::tempdir()
        .map_err(|e| Error::io("failed to create a temporary run directory", e))?;
    let state_path = dir.path().join(store::STATE_FILENAME);
    store::write_state(state, &state_path).await?;

    let command = [evaluator.as_os_str().to_os_string(), state_path.into_os_string()];
    match run_with_limits(&command, time_limit, memory_limit, None).await {
        Ok(RunOutput { status, stderr, .. }) => {
            let outcome = classify_exit_status(status);
            if outcome == Outcome::Error {
                warn!(
                    "evaluator `{evaluator}` terminated abnormally ({status}): {stderr}",
                    evaluator = evaluator.display(),
                    stderr = stderr.trim(),
                );
            }

            Ok(outcome)
        }
        Err(Error::Io { ref source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            Err(Error::Evaluator(format!(
                "evaluator `{evaluator}` was not found",
                evaluator = evaluator.display()
            )))
        }
        Err(e) => {
            warn!("failed to run evaluator: {e}");
            Ok(Outcome::Error)
        }
    }
}
