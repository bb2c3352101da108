//! The Slurm array-job evaluation environment.
//!
//! Each batch of successors becomes one array job: every successor gets its
//! own run directory on a filesystem shared between the login and the
//! compute nodes, a rendered job script runs the evaluator on each state and
//! records its exit code next to it, and the login node polls `sacct` until
//! enough verdicts are in.
//!
//! Spinning up a Slurm test cluster is impractical in CI, so the submission
//! and polling plumbing is exercised against recorded command output in the
//! unit tests below; behavior against a live cluster is verified by hand.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::slice;
use std::sync::LazyLock;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use regex::Regex;
use tokio::process::Command;
use tokio::time;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::Environment;
use crate::EnvironmentOptions;
use crate::Error;
use crate::Outcome;
use crate::Result;
use crate::State;
use crate::Successor;
use crate::classify_exit_code;
use crate::config::SlurmConfig;
use crate::config::memory_in_kib;
use crate::store;

/// The template for the array-job submission script.
const JOB_TEMPLATE: &str = include_str!("slurm-array-job.sh.in");

/// The name of the rendered submission script within the evaluation root.
const SBATCH_FILENAME: &str = "slurm-array-job.sbatch";

/// The name of the file an array task writes its evaluator's exit code to.
const EXIT_CODE_FILENAME: &str = "exit_code";

/// The fraction of the reserved memory used for the soft address-space
/// limit.
///
/// Keeping the soft limit below the hard Slurm reservation lets an evaluator
/// observe failed allocations and report a memout before the OOM killer
/// intervenes.
const SOFT_MEMORY_FRACTION: f64 = 0.98;

/// The scheduler state of an array task.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskState {
    /// The task is queued and waiting for initiation.
    Pending,
    /// The task is currently running.
    Running,
    /// The task was requeued and will run again.
    Requeued,
    /// The task is currently suspended.
    Suspended,
    /// The task terminated and its exit code is (or will become) visible in
    /// its run directory.
    Completed,
    /// Any state outside the busy and done vocabularies, e.g. `FAILED`,
    /// `CANCELLED`, `TIMEOUT`, or `NODE_FAIL`.
    Critical(String),
}

impl TaskState {
    /// Parses a state word as printed by `sacct`.
    fn parse(s: &str) -> Self {
        match s {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "REQUEUED" => Self::Requeued,
            "SUSPENDED" => Self::Suspended,
            "COMPLETED" => Self::Completed,
            other => Self::Critical(other.to_string()),
        }
    }

    /// The task has not yet terminated.
    fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Running | Self::Requeued | Self::Suspended
        )
    }

    /// The task terminated normally.
    fn is_done(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// The task ended in a state the evaluation cannot recover from.
    fn is_critical(&self) -> bool {
        matches!(self, Self::Critical(_))
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Requeued => write!(f, "REQUEUED"),
            Self::Suspended => write!(f, "SUSPENDED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Critical(state) => write!(f, "{state}"),
        }
    }
}

/// A single successor within a submitted array job.
#[derive(Debug)]
struct EvaluationTask<S> {
    /// The successor under evaluation; taken when the task wins.
    successor: Option<Successor<S>>,
    /// The zero-based index of the task within its batch.
    task_id: usize,
    /// The task's run directory on the shared filesystem.
    run_dir: PathBuf,
    /// The last observed scheduler state.
    status: TaskState,
    /// The classified verdict, once the exit code has been read.
    verdict: Option<Outcome>,
    /// Whether the task was excluded from the winner search.
    skipped: bool,
}

/// A submitted array job and its tasks.
#[derive(Debug)]
struct EvaluationTaskBatch<S> {
    /// The scheduler-assigned array job id.
    ///
    /// `None` when submission failed and the whole batch was skipped.
    job_id: Option<String>,
    /// The tasks in submission order.
    ///
    /// Deterministic successor choice may truncate this list when a task
    /// ends in a critical state.
    tasks: Vec<EvaluationTask<S>>,
    /// Whether a critical task discarded a suffix of the batch.
    truncated: bool,
    /// The improving successor discovered while polling.
    winner: Option<Successor<S>>,
    /// Whether the batch has been waited for.
    waited: bool,
}

/// Evaluates batches of successors in parallel on a Slurm cluster.
///
/// The search runs on the login node; every submitted batch is expanded
/// into per-task run directories under the evaluation root and dispatched
/// as a single array job. Task directories are kept after the search so
/// failed evaluations can be inspected post mortem.
pub struct SlurmEnvironment<S> {
    /// The validated cluster configuration.
    config: SlurmConfig,
    /// The shared environment options.
    options: EnvironmentOptions,
    /// The root directory holding one subdirectory per batch.
    eval_dir: PathBuf,
    /// The path the rendered submission script is written to.
    sbatch_path: PathBuf,
    /// The monotone batch counter; batch directories are never reused.
    batch_id: usize,
    /// The batch currently in flight.
    current: Option<EvaluationTaskBatch<S>>,
}

impl<S: State> SlurmEnvironment<S> {
    /// The default number of successors evaluated in parallel.
    pub const DEFAULT_BATCH_SIZE: usize = 200;

    /// Creates the environment with the default options: batches of
    /// [`DEFAULT_BATCH_SIZE`](Self::DEFAULT_BATCH_SIZE) successors and
    /// nondeterministic successor choice.
    pub fn new(config: SlurmConfig) -> Result<Self> {
        Self::with_options(config, EnvironmentOptions::new(Self::DEFAULT_BATCH_SIZE))
    }

    /// Creates the environment with the given options.
    ///
    /// Validates the configuration, resolves the evaluation root, and
    /// creates it. All misconfigurations (whitespace in the evaluation
    /// root, malformed memory limits, unset exported variables) are fatal
    /// here, before any job is submitted.
    pub fn with_options(config: SlurmConfig, options: EnvironmentOptions) -> Result<Self> {
        options.validate()?;
        config.validate()?;

        let eval_dir = config.resolved_eval_dir()?;
        if eval_dir.to_string_lossy().chars().any(char::is_whitespace) {
            // The path is spliced into a shell script.
            return Err(Error::Configuration(format!(
                "evaluation root `{eval_dir}` must not contain whitespace",
                eval_dir = eval_dir.display()
            )));
        }

        std::fs::create_dir_all(&eval_dir).map_err(|e| {
            Error::io(
                format!(
                    "failed to create evaluation root `{eval_dir}`",
                    eval_dir = eval_dir.display()
                ),
                e,
            )
        })?;

        Ok(Self {
            sbatch_path: eval_dir.join(SBATCH_FILENAME),
            config,
            options,
            eval_dir,
            batch_id: 0,
            current: None,
        })
    }

    /// The interval between two scheduler polls.
    fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.config.polling_interval)
    }

    /// The interval between two filesystem probes.
    fn filesystem_interval(&self) -> Duration {
        Duration::from_secs(self.config.filesystem_interval)
    }

    /// The limit after which an expected file is treated as missing.
    fn filesystem_limit(&self) -> Duration {
        Duration::from_secs(self.config.filesystem_time_limit)
    }

    /// Creates the run directories for *batch* and writes the state files.
    ///
    /// Returns once every run directory is visible on the shared
    /// filesystem. A directory collision is a submission error: batch
    /// directories are never reused, so a collision means the evaluation
    /// root is shared with another search.
    async fn materialize_batch(
        &self,
        batch: Vec<Successor<S>>,
        batch_name: &str,
    ) -> Result<Vec<EvaluationTask<S>>> {
        let batch_dir = self.eval_dir.join(batch_name);
        tokio::fs::create_dir_all(&batch_dir).await.map_err(|e| {
            Error::io(
                format!(
                    "failed to create batch directory `{batch_dir}`",
                    batch_dir = batch_dir.display()
                ),
                e,
            )
        })?;

        let mut tasks = Vec::with_capacity(batch.len());
        for (task_id, successor) in batch.into_iter().enumerate() {
            let run_dir = batch_dir.join(format!("{task_id:03}"));
            tokio::fs::create_dir(&run_dir).await.map_err(|e| {
                Error::Submission(format!(
                    "run directory `{run_dir}` could not be created: {e}",
                    run_dir = run_dir.display()
                ))
            })?;

            store::write_state(&successor.state, &run_dir.join(&self.config.state_filename))
                .await?;

            tasks.push(EvaluationTask {
                successor: Some(successor),
                task_id,
                run_dir,
                status: TaskState::Pending,
                verdict: None,
                skipped: false,
            });
        }

        // Give the shared filesystem time to show the new directories.
        let run_dirs: Vec<PathBuf> = tasks.iter().map(|task| task.run_dir.clone()).collect();
        if !store::wait_for_paths(&run_dirs, self.filesystem_interval(), self.filesystem_limit())
            .await
        {
            return Err(Error::FilesystemTimeout {
                path: batch_dir,
                limit: self.config.filesystem_time_limit,
            });
        }

        Ok(tasks)
    }

    /// Renders the submission script for the given tasks.
    fn render_job_script(
        &self,
        tasks: &[EvaluationTask<S>],
        job_name: &str,
        evaluator: &Path,
    ) -> Result<String> {
        let memory_per_cpu_kib = memory_in_kib(&self.config.memory_per_cpu)?;
        let soft_memory_limit =
            (SOFT_MEMORY_FRACTION * self.config.cpus_per_task as f64 * memory_per_cpu_kib as f64)
                as u64;
        let run_dirs = tasks
            .iter()
            .map(|task| task.run_dir.display().to_string())
            .collect::<Vec<_>>()
            .join(" ");

        let substitutions = [
            ("job_name", job_name.to_string()),
            ("logfile", "slurm.log".to_string()),
            ("errfile", "slurm.err".to_string()),
            ("partition", self.config.partition.clone()),
            ("qos", self.config.qos.clone()),
            ("memory_per_cpu", self.config.memory_per_cpu.clone()),
            ("cpus_per_task", self.config.cpus_per_task.to_string()),
            ("nice", self.config.nice.to_string()),
            ("last_task_id", (tasks.len() - 1).to_string()),
            ("mailtype", "NONE".to_string()),
            ("mailuser", String::new()),
            ("extra_options", self.config.extra_options.clone()),
            ("environment_setup", self.config.setup.clone()),
            ("soft_memory_limit", soft_memory_limit.to_string()),
            ("evaluator", evaluator.display().to_string()),
            ("state_filename", self.config.state_filename.clone()),
            ("run_dirs", run_dirs),
        ];

        let mut script = JOB_TEMPLATE.to_string();
        for (key, value) in substitutions {
            script = script.replace(&format!("{{{key}}}"), &value);
        }

        Ok(script)
    }

    /// Submits the rendered script with `sbatch` and parses the job id.
    async fn submit_job(&self) -> Result<String> {
        let output = Command::new("sbatch")
            .arg(format!("--export={}", self.config.export.join(",")))
            .arg(&self.sbatch_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Submission(format!("failed to spawn `sbatch`: {e}")))?;

        if !output.status.success() {
            return Err(Error::Submission(format!(
                "`sbatch` failed ({status}): {stderr}",
                status = output.status,
                stderr = String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_job_id(&stdout).ok_or_else(|| {
            Error::Submission("no job id printed after job submission".to_string())
        })
    }

    /// Queries `sacct` for the current states of all tasks of *job_id*.
    async fn query_task_states(job_id: &str) -> Result<HashMap<usize, TaskState>> {
        let output = Command::new("sacct")
            .args(["-j", job_id, "--format=jobid,state", "--noheader", "--allocations"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Polling(format!("failed to spawn `sacct`: {e}")))?;

        if !output.status.success() {
            return Err(Error::Polling(format!(
                "`sacct` failed ({status}): {stderr}",
                status = output.status,
                stderr = String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_task_states(job_id, &String::from_utf8_lossy(&output.stdout))
    }

    /// Waits for a task's `exit_code` file and classifies its contents.
    async fn read_verdict(&self, task: &EvaluationTask<S>) -> Result<Outcome> {
        let path = task.run_dir.join(EXIT_CODE_FILENAME);
        if !store::wait_for_paths(
            slice::from_ref(&path),
            self.filesystem_interval(),
            self.filesystem_limit(),
        )
        .await
        {
            return Err(Error::FilesystemTimeout {
                path,
                limit: self.config.filesystem_time_limit,
            });
        }

        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::io(
                format!(
                    "failed to read exit code file `{path}`",
                    path = path.display()
                ),
                e,
            )
        })?;

        match contents.trim().parse::<i32>() {
            Ok(code) => Ok(classify_exit_code(code)),
            Err(_) => {
                warn!(
                    "exit code file `{path}` is malformed; treating the evaluation as an error",
                    path = path.display()
                );
                Ok(Outcome::Error)
            }
        }
    }

    /// Polls the scheduler until the batch has enough verdicts.
    ///
    /// With nondeterministic successor choice this reads exit codes as
    /// tasks settle and returns as soon as one of them is a success; with
    /// deterministic choice it only returns once no kept task is busy.
    async fn poll_batch(&self, batch: &mut EvaluationTaskBatch<S>) -> Result<()> {
        let job_id = batch.job_id.clone().expect("batch should have a job id");

        loop {
            time::sleep(self.polling_interval()).await;

            let states = Self::query_task_states(&job_id).await?;
            apply_status_updates(&job_id, batch, &states);

            if self.options.allow_nondeterministic_successor_choice {
                exclude_critical_tasks(&job_id, batch);

                if self.collect_settled_tasks(batch).await? {
                    return Ok(());
                }
            } else {
                truncate_at_first_critical(&job_id, batch)?;
            }

            let busy = batch
                .tasks
                .iter()
                .filter(|task| task.status.is_busy())
                .count();
            if busy == 0 {
                info!("batch job {job_id} completed");
                return Ok(());
            }

            info!(
                "{busy} task{s} of job {job_id} still busy",
                s = if busy == 1 { " is" } else { "s are" }
            );
        }
    }

    /// Reads the exit codes of newly settled tasks in index order.
    ///
    /// Returns `true` once an improving successor has been found and stored
    /// in the batch. A task whose exit code never appears is excluded from
    /// the winner search.
    async fn collect_settled_tasks(&self, batch: &mut EvaluationTaskBatch<S>) -> Result<bool> {
        for index in 0..batch.tasks.len() {
            let task = &batch.tasks[index];
            if task.skipped || task.verdict.is_some() || !task.status.is_done() {
                continue;
            }

            match self.read_verdict(task).await {
                Ok(outcome) => {
                    debug!("task {index} finished with outcome {outcome}");
                    batch.tasks[index].verdict = Some(outcome);
                    if outcome.is_success() {
                        batch.winner = batch.tasks[index]
                            .successor
                            .take();
                        return Ok(true);
                    }
                }
                Err(e @ Error::FilesystemTimeout { .. }) => {
                    warn!("{e}; continuing with the next task");
                    batch.tasks[index].skipped = true;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(false)
    }
}

impl<S: State> Environment<S> for SlurmEnvironment<S> {
    fn batch_size(&self) -> usize {
        self.options.batch_size
    }

    fn submit<'a>(
        &'a mut self,
        batch: Vec<Successor<S>>,
        evaluator: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            assert!(self.current.is_none(), "a batch is already in flight");
            assert!(!batch.is_empty(), "batch must not be empty");
            assert!(
                batch.len() <= self.options.batch_size,
                "batch exceeds the configured batch size"
            );

            self.batch_id += 1;
            let batch_name = format!("batch_{batch_id:03}", batch_id = self.batch_id);
            let job_name = format!(
                "{stem}_{batch_name}",
                stem = evaluator
                    .file_stem()
                    .unwrap_or(evaluator.as_os_str())
                    .to_string_lossy()
            );

            let tasks = self.materialize_batch(batch, &batch_name).await?;
            let script = self.render_job_script(&tasks, &job_name, evaluator)?;
            tokio::fs::write(&self.sbatch_path, script).await.map_err(|e| {
                Error::io(
                    format!(
                        "failed to write submission script `{path}`",
                        path = self.sbatch_path.display()
                    ),
                    e,
                )
            })?;

            match self.submit_job().await {
                Ok(job_id) => {
                    info!("submitted batch job {job_id}");
                    self.current = Some(EvaluationTaskBatch {
                        job_id: Some(job_id),
                        tasks,
                        truncated: false,
                        winner: None,
                        waited: false,
                    });
                    Ok(())
                }
                Err(e) if self.options.allow_nondeterministic_successor_choice => {
                    warn!("{e}; skipping this batch");
                    self.current = Some(EvaluationTaskBatch {
                        job_id: None,
                        tasks: Vec::new(),
                        truncated: false,
                        winner: None,
                        waited: false,
                    });
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        .boxed()
    }

    fn wait_until_finished(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            let mut batch = self.current.take().expect("no batch is in flight");
            assert!(!batch.waited, "the batch was already waited for");
            batch.waited = true;

            let result = if batch.job_id.is_some() {
                self.poll_batch(&mut batch).await
            } else {
                // Submission was skipped; there is nothing to wait for.
                Ok(())
            };

            self.current = Some(batch);
            result
        }
        .boxed()
    }

    fn get_improving_successor(&mut self) -> BoxFuture<'_, Result<Option<Successor<S>>>> {
        async move {
            let mut batch = self.current.take().expect("no batch is in flight");
            assert!(batch.waited, "the batch has not been waited for");

            if let Some(winner) = batch.winner.take() {
                return Ok(Some(winner));
            }

            let Some(job_id) = batch.job_id.clone() else {
                return Ok(None);
            };

            let nondeterministic = self.options.allow_nondeterministic_successor_choice;
            let mut winner = None;
            let mut timeouts = 0;
            let mut memouts = 0;

            for index in 0..batch.tasks.len() {
                if batch.tasks[index].skipped {
                    continue;
                }

                let verdict = match batch.tasks[index].verdict {
                    Some(verdict) => verdict,
                    None => match self.read_verdict(&batch.tasks[index]).await {
                        Ok(verdict) => verdict,
                        Err(e @ Error::FilesystemTimeout { .. }) if nondeterministic => {
                            warn!("{e}; continuing with the next task");
                            continue;
                        }
                        Err(e) => return Err(e),
                    },
                };
                batch.tasks[index].verdict = Some(verdict);

                match verdict {
                    Outcome::Success => {
                        winner = batch.tasks[index].successor.take();
                        break;
                    }
                    Outcome::Timeout => timeouts += 1,
                    Outcome::Memout => memouts += 1,
                    Outcome::Failure | Outcome::Error => {}
                }
            }

            if timeouts > 0 || memouts > 0 {
                info!(
                    "job {job_id}: {timeouts} evaluation(s) timed out, {memouts} ran out of memory"
                );
            }

            if winner.is_none() && batch.truncated {
                // Sequential semantics cannot be recovered once the batch
                // lost its tail.
                return Err(Error::Evaluator(format!(
                    "job {job_id}: a task in a critical scheduler state truncated the batch \
                     before an improving successor was found"
                )));
            }

            Ok(winner)
        }
        .boxed()
    }
}

/// Extracts the job id from the output of `sbatch`.
fn parse_job_id(stdout: &str) -> Option<String> {
    /// Matches the submission confirmation printed by `sbatch`.
    static SUBMITTED: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"Submitted batch job (\d+)").expect("regex should be valid"));

    SUBMITTED
        .captures(stdout)
        .map(|captures| captures[1].to_string())
}

/// Parses the `sacct` status listing for *job_id*.
///
/// Every line must match `<job>_<task> <STATE>`; `sacct` suffixes ids and
/// states of requeued jobs with `+`.
fn parse_task_states(job_id: &str, output: &str) -> Result<HashMap<usize, TaskState>> {
    /// Matches one `sacct` output line.
    static STATUS_LINE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*(?P<job>\d+)_(?P<task>\d+)\+?\s+(?P<state>\w+)\+?\s*$")
            .expect("regex should be valid")
    });

    let mut states = HashMap::new();
    for line in output.lines() {
        let captures = STATUS_LINE.captures(line).ok_or_else(|| {
            Error::Polling(format!("unexpected `sacct` output line `{line}`"))
        })?;

        if &captures["job"] != job_id {
            return Err(Error::Polling(format!(
                "`sacct` reported the state of foreign job `{job}`",
                job = &captures["job"]
            )));
        }

        let task_id = captures["task"].parse().map_err(|_| {
            Error::Polling(format!(
                "task id `{task}` is out of range",
                task = &captures["task"]
            ))
        })?;

        states.insert(task_id, TaskState::parse(&captures["state"]));
    }

    Ok(states)
}

/// Updates the scheduler status of every task reported by the last poll.
///
/// A task missing from the listing keeps its previous status; `sacct` omits
/// array tasks it has no individual record for yet.
fn apply_status_updates<S>(
    job_id: &str,
    batch: &mut EvaluationTaskBatch<S>,
    states: &HashMap<usize, TaskState>,
) {
    for task in batch.tasks.iter_mut() {
        if let Some(state) = states.get(&task.task_id)
            && *state != task.status
        {
            debug!(
                "task status of {job_id}_{task_id} is {state}",
                task_id = task.task_id
            );
            task.status = state.clone();
        }
    }
}

/// Excludes tasks in critical scheduler states from the winner search.
///
/// Used with nondeterministic successor choice, where losing an arbitrary
/// subset of the batch only narrows the choice.
fn exclude_critical_tasks<S>(job_id: &str, batch: &mut EvaluationTaskBatch<S>) {
    for task in batch.tasks.iter_mut() {
        if task.status.is_critical() && !task.skipped {
            warn!(
                "task {task_id} of job {job_id} is in critical state {status}; excluding it \
                 from the winner search (run dir: `{run_dir}`)",
                task_id = task.task_id,
                status = task.status,
                run_dir = task.run_dir.display()
            );
            task.skipped = true;
        }
    }
}

/// Discards the first critical task and everything after it.
///
/// Used with deterministic successor choice: a sequential evaluation would
/// never have looked past a failing task, so the tail of the batch must not
/// produce the winner. A critical task at index 0 leaves nothing to commit
/// to and aborts the batch.
fn truncate_at_first_critical<S>(job_id: &str, batch: &mut EvaluationTaskBatch<S>) -> Result<()> {
    let Some(index) = batch
        .tasks
        .iter()
        .position(|task| task.status.is_critical())
    else {
        return Ok(());
    };

    let task = &batch.tasks[index];
    if index == 0 {
        return Err(Error::Evaluator(format!(
            "task 0 of job {job_id} is in critical state {status} (run dir: `{run_dir}`)",
            status = task.status,
            run_dir = task.run_dir.display()
        )));
    }

    warn!(
        "task {index} of job {job_id} is in critical state {status}; discarding it and all \
         later tasks of the batch",
        status = task.status
    );
    batch.tasks.truncate(index);
    batch.truncated = true;

    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Builds a batch with one task per given status.
    fn batch_with_statuses(statuses: &[TaskState]) -> EvaluationTaskBatch<serde_json::Value> {
        let tasks = statuses
            .iter()
            .enumerate()
            .map(|(task_id, status)| EvaluationTask {
                successor: Some(Successor::new(
                    serde_json::json!({ "n": task_id }),
                    format!("successor {task_id}"),
                )),
                task_id,
                run_dir: PathBuf::from(format!("/shared/eval_dir/batch_001/{task_id:03}")),
                status: status.clone(),
                verdict: None,
                skipped: false,
            })
            .collect();

        EvaluationTaskBatch {
            job_id: Some("7417".to_string()),
            tasks,
            truncated: false,
            winner: None,
            waited: false,
        }
    }

    #[test]
    fn job_ids_parse_from_sbatch_output() {
        assert_eq!(
            parse_job_id("Submitted batch job 417941\n").as_deref(),
            Some("417941")
        );
        assert_eq!(parse_job_id("sbatch: error: invalid partition\n"), None);
        assert_eq!(parse_job_id(""), None);
    }

    #[test]
    fn task_states_parse_from_sacct_output() {
        let output = "7417_0  COMPLETED\n  7417_1+  RUNNING+  \n7417_2  FAILED\n";
        let states = parse_task_states("7417", output).expect("output should parse");

        assert_eq!(states.len(), 3);
        assert_eq!(states[&0], TaskState::Completed);
        assert_eq!(states[&1], TaskState::Running);
        assert_eq!(states[&2], TaskState::Critical("FAILED".to_string()));
    }

    #[test]
    fn malformed_sacct_lines_are_polling_errors() {
        for output in [
            "7417_0 COMPLETED trailing",
            "not a status line",
            "7417 COMPLETED",
        ] {
            assert!(
                matches!(
                    parse_task_states("7417", output),
                    Err(Error::Polling(_))
                ),
                "`{output}` should be rejected"
            );
        }
    }

    #[test]
    fn foreign_job_ids_are_polling_errors() {
        assert!(matches!(
            parse_task_states("7417", "9999_0  COMPLETED\n"),
            Err(Error::Polling(_))
        ));
    }

    #[test]
    fn state_vocabulary_classifies() {
        for state in ["PENDING", "RUNNING", "REQUEUED", "SUSPENDED"] {
            assert!(TaskState::parse(state).is_busy(), "{state} should be busy");
        }

        assert!(TaskState::parse("COMPLETED").is_done());

        for state in ["FAILED", "CANCELLED", "TIMEOUT", "NODE_FAIL", "OUT_OF_MEMORY"] {
            assert!(
                TaskState::parse(state).is_critical(),
                "{state} should be critical"
            );
        }
    }

    #[test]
    fn missing_sacct_rows_keep_the_previous_status() {
        let mut batch = batch_with_statuses(&[TaskState::Running, TaskState::Pending]);
        let states = HashMap::from([(1, TaskState::Completed)]);

        apply_status_updates("7417", &mut batch, &states);

        assert_eq!(batch.tasks[0].status, TaskState::Running);
        assert_eq!(batch.tasks[1].status, TaskState::Completed);
    }

    #[test]
    fn nondeterministic_choice_excludes_critical_tasks() {
        let mut batch = batch_with_statuses(&[
            TaskState::Completed,
            TaskState::Critical("FAILED".to_string()),
            TaskState::Pending,
        ]);

        exclude_critical_tasks("7417", &mut batch);

        assert!(!batch.tasks[0].skipped);
        assert!(batch.tasks[1].skipped);
        assert!(!batch.tasks[2].skipped);
        assert_eq!(batch.tasks.len(), 3);
    }

    #[test]
    fn deterministic_choice_truncates_at_the_first_critical_task() {
        let mut batch = batch_with_statuses(&[
            TaskState::Completed,
            TaskState::Critical("NODE_FAIL".to_string()),
            TaskState::Completed,
        ]);

        truncate_at_first_critical("7417", &mut batch).expect("truncation should succeed");

        assert_eq!(batch.tasks.len(), 1);
        assert!(batch.truncated);
    }

    #[test]
    fn deterministic_choice_aborts_on_a_critical_first_task() {
        let mut batch = batch_with_statuses(&[
            TaskState::Critical("CANCELLED".to_string()),
            TaskState::Running,
        ]);

        assert!(matches!(
            truncate_at_first_critical("7417", &mut batch),
            Err(Error::Evaluator(_))
        ));
    }

    #[tokio::test]
    async fn rendered_scripts_fill_every_variable() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let mut config = SlurmConfig::new("infai_1", "normal", "3872M");
        config.eval_dir = Some(dir.path().join("eval_dir"));

        let environment: SlurmEnvironment<serde_json::Value> =
            SlurmEnvironment::new(config).expect("environment should construct");

        let batch = vec![
            Successor::new(serde_json::json!({"n": 1}), "n = 1"),
            Successor::new(serde_json::json!({"n": 2}), "n = 2"),
            Successor::new(serde_json::json!({"n": 3}), "n = 3"),
        ];
        let tasks = environment
            .materialize_batch(batch, "batch_001")
            .await
            .expect("materialization should succeed");

        let script = environment
            .render_job_script(&tasks, "evaluate_batch_001", Path::new("/opt/evaluate"))
            .expect("script should render");

        assert!(script.contains("#SBATCH --job-name=evaluate_batch_001"));
        assert!(script.contains("#SBATCH --partition=infai_1"));
        assert!(script.contains("#SBATCH --qos=normal"));
        assert!(script.contains("#SBATCH --mem-per-cpu=3872M"));
        assert!(script.contains("#SBATCH --array=0-2"));
        // 0.98 * 1 CPU * 3872 MiB in KiB.
        assert!(script.contains("ulimit -S -v 3885629"));
        assert!(script.contains("\"/opt/evaluate\" \"state.json\""));
        assert!(script.contains("#SBATCH --mail-type=NONE"));
        assert!(script.contains("batch_001/000 "));
        assert!(script.contains("batch_001/002"));
    }

    #[tokio::test]
    async fn run_directory_collisions_are_submission_errors() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let mut config = SlurmConfig::new("infai_1", "normal", "3872M");
        config.eval_dir = Some(dir.path().join("eval_dir"));

        let environment: SlurmEnvironment<serde_json::Value> =
            SlurmEnvironment::new(config).expect("environment should construct");

        std::fs::create_dir_all(dir.path().join("eval_dir/batch_001/000"))
            .expect("should pre-create the colliding directory");

        let batch = vec![Successor::new(serde_json::json!({"n": 1}), "n = 1")];
        let result = environment.materialize_batch(batch, "batch_001").await;

        assert!(matches!(result, Err(Error::Submission(_))));
    }

    #[test]
    fn whitespace_in_the_evaluation_root_is_fatal() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let mut config = SlurmConfig::new("infai_1", "normal", "3872M");
        config.eval_dir = Some(dir.path().join("eval dir"));

        let result: Result<SlurmEnvironment<serde_json::Value>> = SlurmEnvironment::new(config);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    /// Builds an environment over a fresh evaluation root and materializes
    /// one batch of three counter states.
    async fn environment_with_batch(
        options: EnvironmentOptions,
    ) -> (
        tempfile::TempDir,
        SlurmEnvironment<serde_json::Value>,
        Vec<EvaluationTask<serde_json::Value>>,
    ) {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let mut config = SlurmConfig::new("infai_1", "normal", "3872M");
        config.eval_dir = Some(dir.path().join("eval_dir"));

        let environment =
            SlurmEnvironment::with_options(config, options).expect("environment should construct");

        let batch = (0..3)
            .map(|n| Successor::new(serde_json::json!({ "n": n }), format!("successor {n}")))
            .collect();
        let tasks = environment
            .materialize_batch(batch, "batch_001")
            .await
            .expect("materialization should succeed");

        (dir, environment, tasks)
    }

    /// Writes an exit code file into a task's run directory.
    fn write_exit_code(task: &EvaluationTask<serde_json::Value>, code: i32) {
        std::fs::write(task.run_dir.join(EXIT_CODE_FILENAME), format!("{code}\n"))
            .expect("should write exit code");
    }

    #[tokio::test]
    async fn settled_successes_commit_before_busy_tasks_finish() {
        let (_dir, environment, mut tasks) =
            environment_with_batch(EnvironmentOptions::new(3)).await;

        // Task 2 finished first and succeeded; tasks 0 and 1 are still
        // running. With nondeterministic choice the batch commits to task 2
        // without waiting for the rest.
        write_exit_code(&tasks[2], 0);
        tasks[0].status = TaskState::Running;
        tasks[1].status = TaskState::Running;
        tasks[2].status = TaskState::Completed;

        let mut batch = EvaluationTaskBatch {
            job_id: Some("7417".to_string()),
            tasks,
            truncated: false,
            winner: None,
            waited: true,
        };

        let found = environment
            .collect_settled_tasks(&mut batch)
            .await
            .expect("collection should succeed");

        assert!(found);
        assert_eq!(
            batch.winner.as_ref().expect("batch should have a winner").change,
            "successor 2"
        );
    }

    #[tokio::test]
    async fn deterministic_collection_prefers_the_lowest_index() {
        let options = EnvironmentOptions {
            batch_size: 3,
            allow_nondeterministic_successor_choice: false,
        };
        let (_dir, mut environment, mut tasks) = environment_with_batch(options).await;

        // Tasks 0 and 2 both succeeded; sequential semantics demand that
        // the lower index wins.
        write_exit_code(&tasks[0], 0);
        write_exit_code(&tasks[1], 1);
        write_exit_code(&tasks[2], 0);
        for task in tasks.iter_mut() {
            task.status = TaskState::Completed;
        }

        environment.current = Some(EvaluationTaskBatch {
            job_id: Some("7417".to_string()),
            tasks,
            truncated: false,
            winner: None,
            waited: true,
        });

        let winner = environment
            .get_improving_successor()
            .await
            .expect("collection should succeed")
            .expect("a successor should win");

        assert_eq!(winner.change, "successor 0");
    }

    #[tokio::test]
    async fn truncated_batches_without_winner_abort_the_search() {
        let options = EnvironmentOptions {
            batch_size: 3,
            allow_nondeterministic_successor_choice: false,
        };
        let (_dir, mut environment, mut tasks) = environment_with_batch(options).await;

        // The surviving prefix of a truncated batch found no improvement;
        // sequential semantics cannot be recovered.
        write_exit_code(&tasks[0], 1);
        tasks[0].status = TaskState::Completed;
        tasks.truncate(1);

        environment.current = Some(EvaluationTaskBatch {
            job_id: Some("7417".to_string()),
            tasks,
            truncated: true,
            winner: None,
            waited: true,
        });

        let result = environment.get_improving_successor().await;
        assert!(matches!(result, Err(Error::Evaluator(_))));
    }

    #[test]
    fn padded_and_suffixed_listings_parse() {
        let output = "   417941_0+   COMPLETED+\n   417941_1    TIMEOUT   \n";
        let states = parse_task_states("417941", output).expect("output should parse");
        assert_eq!(states[&0], TaskState::Completed);
        assert_eq!(states[&1], TaskState::Critical("TIMEOUT".to_string()));
    }
}
