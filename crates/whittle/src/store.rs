//! Reading and writing search states on disk.
//!
//! States travel between the search and its evaluators as files: the local
//! environment writes them into temporary directories, the cluster
//! environment into per-task run directories on a filesystem shared between
//! the login and the compute nodes. The encoding is self-describing JSON, so
//! evaluators written in any language can read the files.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time;

use crate::Error;
use crate::Result;

/// The default filename under which states are stored in run directories.
pub const STATE_FILENAME: &str = "state.json";

/// A search state the engine can ship between processes.
///
/// The engine treats states as opaque values: only successor generators and
/// the evaluator interpret their contents. Any serializable value qualifies;
/// the round trip through [`write_state`] and [`read_state`] is lossless.
pub trait State: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> State for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Writes *state* to *path* as self-describing JSON.
pub async fn write_state<S: State>(state: &S, path: &Path) -> Result<()> {
    let bytes = serde_json::to_vec(state).map_err(|e| Error::state("failed to serialize state", e))?;

    tokio::fs::write(path, bytes).await.map_err(|e| {
        Error::io(
            format!("failed to write state file `{path}`", path = path.display()),
            e,
        )
    })
}

/// Reads a state previously written with [`write_state`].
pub async fn read_state<S: State>(path: &Path) -> Result<S> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        Error::io(
            format!("failed to read state file `{path}`", path = path.display()),
            e,
        )
    })?;

    serde_json::from_slice(&bytes).map_err(|e| {
        Error::state(
            format!(
                "failed to deserialize state file `{path}`",
                path = path.display()
            ),
            e,
        )
    })
}

/// Waits until every path in *paths* exists.
///
/// Files written by one node of a shared filesystem are not necessarily
/// visible on other nodes immediately. This polls for existence every
/// *interval*, giving up after *limit*, and returns `false` when at least
/// one path is still missing. At most ⌈limit/interval⌉ rounds are polled.
pub async fn wait_for_paths(paths: &[PathBuf], interval: Duration, limit: Duration) -> bool {
    debug_assert!(interval > Duration::ZERO, "poll interval must be positive");

    let attempts = (limit.as_secs_f64() / interval.as_secs_f64()).ceil() as u64;
    for _ in 0..attempts {
        if paths.iter().all(|path| path.exists()) {
            return true;
        }

        time::sleep(interval).await;
    }

    false
}
