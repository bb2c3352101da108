//! Resource-limited execution of child processes.
//!
//! Evaluators launch the tool under investigation through [`run_with_limits`]
//! so that a single misbehaving evaluation cannot stall the whole search or
//! exhaust the machine it runs on. The limits are installed in the child
//! between `fork` and `exec` and enforced by the operating system.

use std::ffi::OsStr;
use std::path::Path;
use std::process::ExitStatus;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::Error;
use crate::Result;

/// The number of seconds between the soft and the hard CPU limit.
///
/// When the soft limit is reached the child receives `SIGXCPU`; at the hard
/// limit it is killed. The padding gives an evaluator the opportunity to
/// catch `SIGXCPU` and exit cleanly with a distinguishable code.
pub const CPU_LIMIT_PADDING: u64 = 5;

/// The captured output of a resource-limited child process.
#[derive(Debug)]
pub struct RunOutput {
    /// Everything the child wrote to stdout, decoded as UTF-8.
    pub stdout: String,
    /// Everything the child wrote to stderr, decoded as UTF-8.
    pub stderr: String,
    /// The exit status of the child.
    ///
    /// An exit code of 0 means success. Termination by `SIGXCPU` or
    /// `SIGKILL` indicates that a resource limit was hit; the signal is
    /// available through [`ExitStatusExt`](std::os::unix::process::ExitStatusExt).
    pub status: ExitStatus,
}

/// Runs *command* to completion under CPU-time and address-space limits.
///
/// The child inherits the parent's environment. Before `exec`, it installs a
/// soft CPU limit of *time_limit* seconds (hard limit: *time_limit* plus
/// [`CPU_LIMIT_PADDING`]), a soft address-space limit of *memory_limit* MiB,
/// and a core-dump size of zero. Passing `None` leaves the corresponding
/// limit as inherited.
///
/// If *input_file* is given, its byte contents are piped to the child's
/// standard input, which is then closed; otherwise standard input reads from
/// `/dev/null`. Standard output and standard error are fully captured.
///
/// Returns an error when the child cannot be spawned, most notably when the
/// executable does not exist.
pub async fn run_with_limits<S: AsRef<OsStr>>(
    command: &[S],
    time_limit: Option<Duration>,
    memory_limit: Option<u64>,
    input_file: Option<&Path>,
) -> Result<RunOutput> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| Error::Configuration("cannot run an empty command".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if input_file.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        let time_limit = time_limit.map(|limit| limit.as_secs());
        // Only async-signal-safe calls are allowed between fork and exec,
        // which rules out anything that could allocate.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(secs) = time_limit {
                    set_limit(libc::RLIMIT_CPU as i32, secs, secs + CPU_LIMIT_PADDING)?;
                }
                if let Some(mib) = memory_limit {
                    set_address_space_limit(mib * 1024 * 1024)?;
                }
                set_limit(libc::RLIMIT_CORE as i32, 0, 0)?;
                Ok(())
            });
        }
    }

    let input = match input_file {
        Some(path) => Some(tokio::fs::read(path).await.map_err(|e| {
            Error::io(
                format!("failed to read input file `{path}`", path = path.display()),
                e,
            )
        })?),
        None => None,
    };

    debug!(
        command = ?command
            .iter()
            .map(|part| part.as_ref().to_string_lossy().into_owned())
            .collect::<Vec<_>>(),
        "spawning resource-limited child process"
    );

    let mut child = cmd.spawn().map_err(|e| {
        Error::io(
            format!(
                "failed to spawn `{program}`",
                program = program.as_ref().to_string_lossy()
            ),
            e,
        )
    })?;

    if let Some(bytes) = input {
        let mut stdin = child.stdin.take().expect("child stdin should be piped");
        stdin
            .write_all(&bytes)
            .await
            .map_err(|e| Error::io("failed to write to child stdin", e))?;
        // Dropping the handle closes the pipe.
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::io("failed to wait for child process", e))?;

    Ok(RunOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        status: output.status,
    })
}

/// Sets a resource limit in the forked child.
#[cfg(unix)]
fn set_limit(resource: i32, soft: u64, hard: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft,
        rlim_max: hard,
    };

    if unsafe { libc::setrlimit(resource as _, &limit) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Lowers the soft address-space limit of the forked child to *bytes*.
///
/// The hard limit is left as inherited so that a careful evaluator may raise
/// its own limit again for cleanup work.
#[cfg(unix)]
fn set_address_space_limit(bytes: u64) -> std::io::Result<()> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    if unsafe { libc::getrlimit(libc::RLIMIT_AS as _, &mut limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    limit.rlim_cur = bytes.min(limit.rlim_max);
    if unsafe { libc::setrlimit(libc::RLIMIT_AS as _, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}

/// Extracts the first capture group of *pattern* from *content*, parsed as
/// `T`.
///
/// A convenience for evaluators that grep a tool's output for a measurement:
///
/// ```
/// let content = "Plan length: 12 step(s).\nExpanded 42 state(s).";
/// let expanded: Option<u64> = whittle::parse(content, r"Expanded (\d+) state\(s\)\.");
/// assert_eq!(expanded, Some(42));
/// ```
///
/// Returns `None` when the pattern does not match or the captured text does
/// not parse as `T`.
///
/// # Panics
///
/// Panics if *pattern* is not a valid regular expression or contains no
/// capture group.
pub fn parse<T: FromStr>(content: &str, pattern: &str) -> Option<T> {
    let regex = Regex::new(pattern).expect("invalid regular expression");
    let captures = regex.captures(content)?;
    let group = captures
        .get(1)
        .expect("regular expression has no capture group");

    match group.as_str().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                "captured text `{text}` does not parse as the requested type",
                text = group.as_str()
            );
            None
        }
    }
}
