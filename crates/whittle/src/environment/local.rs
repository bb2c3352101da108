//! The sequential evaluation environment.

use std::path::Path;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::Environment;
use crate::EnvironmentOptions;
use crate::Result;
use crate::State;
use crate::Successor;
use crate::evaluate;

/// The default CPU-time limit for a single local evaluation.
///
/// Successors are evaluated one after the other, so a runaway evaluator
/// would stall the whole search without this bound.
const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(1800);

/// Evaluates successors sequentially on the local machine.
///
/// Successors are evaluated strictly in submission order and evaluation
/// stops at the first success; later successors of the batch are never
/// looked at. Timeouts, memouts, negative verdicts, and evaluator crashes
/// all count as non-success for their successor and do not abort the batch.
#[derive(Debug)]
pub struct LocalEnvironment<S> {
    /// The shared environment options.
    options: EnvironmentOptions,
    /// The CPU-time limit applied to each evaluator invocation.
    time_limit: Option<Duration>,
    /// The address-space limit in MiB applied to each evaluator invocation.
    memory_limit: Option<u64>,
    /// The improving successor of the batch in flight, if one was found.
    successor: Option<Successor<S>>,
    /// Whether a batch is currently in flight.
    in_flight: bool,
    /// Whether the batch in flight has been waited for.
    waited: bool,
}

impl<S: State> LocalEnvironment<S> {
    /// Creates a local environment with the default options: batch size one
    /// and a CPU-time limit of 30 minutes per evaluation.
    pub fn new() -> Self {
        Self::with_options(EnvironmentOptions::default())
            .expect("default options should be valid")
    }

    /// Creates a local environment with the given options.
    pub fn with_options(options: EnvironmentOptions) -> Result<Self> {
        options.validate()?;

        Ok(Self {
            options,
            time_limit: Some(DEFAULT_TIME_LIMIT),
            memory_limit: None,
            successor: None,
            in_flight: false,
            waited: false,
        })
    }

    /// Sets the CPU-time limit applied to each evaluator invocation.
    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Sets the address-space limit in MiB applied to each evaluator
    /// invocation.
    pub fn memory_limit(mut self, mib: u64) -> Self {
        self.memory_limit = Some(mib);
        self
    }
}

impl<S: State> Environment<S> for LocalEnvironment<S> {
    fn batch_size(&self) -> usize {
        self.options.batch_size
    }

    fn submit<'a>(
        &'a mut self,
        batch: Vec<Successor<S>>,
        evaluator: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            assert!(!self.in_flight, "a batch is already in flight");
            assert!(!batch.is_empty(), "batch must not be empty");
            assert!(
                batch.len() <= self.options.batch_size,
                "batch exceeds the configured batch size"
            );

            self.in_flight = true;
            self.waited = false;

            for successor in batch {
                let outcome =
                    evaluate(evaluator, &successor.state, self.time_limit, self.memory_limit)
                        .await?;
                debug!(
                    %outcome,
                    change = %successor.change,
                    "evaluated successor"
                );

                if outcome.is_success() {
                    self.successor = Some(successor);
                    break;
                }
            }

            Ok(())
        }
        .boxed()
    }

    fn wait_until_finished(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            assert!(self.in_flight, "no batch is in flight");
            assert!(!self.waited, "the batch was already waited for");
            self.waited = true;

            // Evaluation happened during submission; nothing to wait for.
            Ok(())
        }
        .boxed()
    }

    fn get_improving_successor(&mut self) -> BoxFuture<'_, Result<Option<Successor<S>>>> {
        async move {
            assert!(self.in_flight, "no batch is in flight");
            assert!(self.waited, "the batch has not been waited for");
            self.in_flight = false;
            self.waited = false;

            Ok(self.successor.take())
        }
        .boxed()
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    /// Writes an executable shell script and returns its path.
    fn script(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("evaluator.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("should write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("should mark script executable");
        path
    }

    #[tokio::test]
    async fn stops_at_the_first_success() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        // Succeed iff the state file contains a value below three.
        let evaluator = script(dir.path(), "n=$(tr -cd '0-9' < \"$1\"); [ \"$n\" -lt 3 ]");

        let mut environment = LocalEnvironment::with_options(EnvironmentOptions::new(4))
            .expect("options should be valid");

        let batch = vec![
            Successor::new(serde_json::json!({"n": 5}), "n = 5"),
            Successor::new(serde_json::json!({"n": 2}), "n = 2"),
            Successor::new(serde_json::json!({"n": 1}), "n = 1"),
        ];

        environment
            .submit(batch, &evaluator)
            .await
            .expect("submission should succeed");
        environment
            .wait_until_finished()
            .await
            .expect("waiting should succeed");
        let winner = environment
            .get_improving_successor()
            .await
            .expect("collection should succeed")
            .expect("a successor should win");

        assert_eq!(winner.change, "n = 2");
    }

    #[tokio::test]
    async fn batches_without_winner_return_none() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let evaluator = script(dir.path(), "exit 1");

        let mut environment = LocalEnvironment::with_options(EnvironmentOptions::new(2))
            .expect("options should be valid");

        environment
            .submit(
                vec![Successor::new(serde_json::json!({"n": 1}), "n = 1")],
                &evaluator,
            )
            .await
            .expect("submission should succeed");
        environment
            .wait_until_finished()
            .await
            .expect("waiting should succeed");
        let winner = environment
            .get_improving_successor()
            .await
            .expect("collection should succeed");

        assert!(winner.is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "no batch is in flight")]
    async fn waiting_without_a_batch_panics() {
        let mut environment: LocalEnvironment<serde_json::Value> = LocalEnvironment::new();
        let _ = environment.wait_until_finished().await;
    }

    #[tokio::test]
    #[should_panic(expected = "the batch has not been waited for")]
    async fn collecting_before_waiting_panics() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let evaluator = script(dir.path(), "exit 1");

        let mut environment = LocalEnvironment::new();
        environment
            .submit(
                vec![Successor::new(serde_json::json!({"n": 1}), "n = 1")],
                &evaluator,
            )
            .await
            .expect("submission should succeed");
        let _ = environment.get_improving_successor().await;
    }

    #[tokio::test]
    async fn rejects_a_zero_batch_size() {
        let result: Result<LocalEnvironment<serde_json::Value>> =
            LocalEnvironment::with_options(EnvironmentOptions::new(0));
        assert!(result.is_err());
    }
}
