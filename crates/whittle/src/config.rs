//! Configuration of the cluster environment.

use std::env;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;
use crate::store::STATE_FILENAME;

/// The default number of seconds between two scheduler polls.
const DEFAULT_POLLING_INTERVAL: u64 = 15;

/// The default number of seconds between two probes for an expected file.
const DEFAULT_FILESYSTEM_INTERVAL: u64 = 3;

/// The default number of seconds after which an expected file that has not
/// appeared is treated as missing.
const DEFAULT_FILESYSTEM_TIME_LIMIT: u64 = 60;

/// Default for [`SlurmConfig::cpus_per_task`].
fn default_cpus_per_task() -> u64 {
    1
}

/// Default for [`SlurmConfig::export`].
fn default_export() -> Vec<String> {
    vec!["PATH".to_string()]
}

/// Default for [`SlurmConfig::extra_options`].
fn default_extra_options() -> String {
    "## (not used)".to_string()
}

/// Default for [`SlurmConfig::state_filename`].
fn default_state_filename() -> String {
    STATE_FILENAME.to_string()
}

/// Default for [`SlurmConfig::polling_interval`].
fn default_polling_interval() -> u64 {
    DEFAULT_POLLING_INTERVAL
}

/// Default for [`SlurmConfig::filesystem_interval`].
fn default_filesystem_interval() -> u64 {
    DEFAULT_FILESYSTEM_INTERVAL
}

/// Default for [`SlurmConfig::filesystem_time_limit`].
fn default_filesystem_time_limit() -> u64 {
    DEFAULT_FILESYSTEM_TIME_LIMIT
}

/// Configuration of the [`SlurmEnvironment`](crate::SlurmEnvironment).
///
/// Violations are reported by [`validate`](Self::validate) when the
/// environment is constructed, before any job is submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SlurmConfig {
    /// The partition jobs are submitted to.
    pub partition: String,

    /// The quality-of-service group jobs run in.
    pub qos: String,

    /// The memory reserved per CPU, e.g. `3872M`.
    ///
    /// Accepts `<number>[k|m|g]`, case-insensitive; a bare number means MiB.
    pub memory_per_cpu: String,

    /// The maximum memory per CPU the partition provides, if limited.
    ///
    /// When set, a `memory_per_cpu` above this value is rejected at
    /// construction instead of failing on the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_per_cpu: Option<String>,

    /// The number of CPUs reserved for evaluating a single successor.
    #[serde(default = "default_cpus_per_task")]
    pub cpus_per_task: u64,

    /// The nice value for submitted jobs (a higher value means a lower
    /// priority).
    #[serde(default)]
    pub nice: u64,

    /// Environment variables forwarded from the login node to the compute
    /// nodes.
    ///
    /// Every listed variable must be set when the environment is
    /// constructed.
    #[serde(default = "default_export")]
    pub export: Vec<String>,

    /// Additional shell commands run on a compute node before the evaluator
    /// (loading modules, activating toolchains, …).
    #[serde(default)]
    pub setup: String,

    /// Extra `#SBATCH` lines spliced verbatim into the submission script.
    #[serde(default = "default_extra_options")]
    pub extra_options: String,

    /// The root directory for run directories, on a filesystem shared with
    /// the compute nodes.
    ///
    /// Defaults to `eval_dir` under the current working directory. The
    /// resolved path must not contain whitespace: it is spliced into the
    /// submission script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_dir: Option<PathBuf>,

    /// The filename states are stored under within each run directory.
    #[serde(default = "default_state_filename")]
    pub state_filename: String,

    /// Seconds between two scheduler polls.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,

    /// Seconds between two probes for a file expected to appear on the
    /// shared filesystem.
    #[serde(default = "default_filesystem_interval")]
    pub filesystem_interval: u64,

    /// Seconds after which a file that has not appeared on the shared
    /// filesystem is treated as missing.
    #[serde(default = "default_filesystem_time_limit")]
    pub filesystem_time_limit: u64,
}

impl SlurmConfig {
    /// Creates a configuration for the given partition, quality-of-service
    /// group, and per-CPU memory, with defaults for everything else.
    pub fn new(
        partition: impl Into<String>,
        qos: impl Into<String>,
        memory_per_cpu: impl Into<String>,
    ) -> Self {
        Self {
            partition: partition.into(),
            qos: qos.into(),
            memory_per_cpu: memory_per_cpu.into(),
            max_memory_per_cpu: None,
            cpus_per_task: default_cpus_per_task(),
            nice: 0,
            export: default_export(),
            setup: String::new(),
            extra_options: default_extra_options(),
            eval_dir: None,
            state_filename: default_state_filename(),
            polling_interval: default_polling_interval(),
            filesystem_interval: default_filesystem_interval(),
            filesystem_time_limit: default_filesystem_time_limit(),
        }
    }

    /// Checks the configuration for fatal misconfigurations.
    pub fn validate(&self) -> Result<()> {
        let memory = memory_in_kib(&self.memory_per_cpu)?;
        if let Some(max) = &self.max_memory_per_cpu {
            let max_memory = memory_in_kib(max)?;
            if memory > max_memory {
                return Err(Error::Configuration(format!(
                    "memory limit `{limit}` surpasses the maximum of `{max}` available on \
                     partition `{partition}`",
                    limit = self.memory_per_cpu,
                    partition = self.partition,
                )));
            }
        }

        if self.cpus_per_task == 0 {
            return Err(Error::Configuration(
                "`cpus_per_task` must be at least one".into(),
            ));
        }

        for variable in &self.export {
            if env::var_os(variable).is_none() {
                return Err(Error::Configuration(format!(
                    "exported environment variable `{variable}` is not set"
                )));
            }
        }

        if self.polling_interval == 0 || self.filesystem_interval == 0 {
            return Err(Error::Configuration(
                "polling and filesystem intervals must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Resolves the evaluation root to an absolute path.
    pub(crate) fn resolved_eval_dir(&self) -> Result<PathBuf> {
        let cwd = env::current_dir()
            .map_err(|e| Error::io("failed to determine the current directory", e))?;

        Ok(match &self.eval_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => cwd.join(dir),
            None => cwd.join("eval_dir"),
        })
    }
}

/// Normalizes a memory limit string to KiB.
///
/// Accepts `<number>` (MiB), `<number>k`, `<number>m`, and `<number>g`,
/// case-insensitive.
pub fn memory_in_kib(limit: &str) -> Result<u64> {
    /// Matches an amount and an optional unit suffix.
    static MEMORY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(?i)(\d+)(k|m|g)?$").expect("regex should be valid"));

    let captures = MEMORY
        .captures(limit)
        .ok_or_else(|| Error::Configuration(format!("malformed memory limit `{limit}`")))?;
    let amount: u64 = captures[1]
        .parse()
        .map_err(|_| Error::Configuration(format!("memory amount in `{limit}` is out of range")))?;

    Ok(
        match captures
            .get(2)
            .map(|suffix| suffix.as_str().to_ascii_lowercase())
            .as_deref()
        {
            Some("k") => amount,
            Some("g") => amount * 1024 * 1024,
            // No suffix means MiB.
            _ => amount * 1024,
        },
    )
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn memory_limits_normalize_to_kib() {
        assert_eq!(memory_in_kib("512k").expect("should parse"), 512);
        assert_eq!(memory_in_kib("512K").expect("should parse"), 512);
        assert_eq!(memory_in_kib("3872M").expect("should parse"), 3_964_928);
        assert_eq!(memory_in_kib("3872").expect("should parse"), 3_964_928);
        assert_eq!(memory_in_kib("2g").expect("should parse"), 2_097_152);
    }

    #[test]
    fn malformed_memory_limits_are_rejected() {
        for limit in ["", "two gigs", "1.5G", "-5M", "12MB", "g"] {
            assert!(
                matches!(memory_in_kib(limit), Err(Error::Configuration(_))),
                "`{limit}` should be rejected"
            );
        }
    }

    #[test]
    fn memory_above_the_partition_maximum_is_rejected() {
        let mut config = SlurmConfig::new("infai_1", "normal", "3872M");
        config.max_memory_per_cpu = Some("3872M".to_string());
        config.validate().expect("limit at the maximum is fine");

        config.memory_per_cpu = "6354M".to_string();
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn unset_export_variables_are_rejected() {
        let mut config = SlurmConfig::new("infai_1", "normal", "3872M");
        config
            .export
            .push("WHITTLE_TEST_UNSET_VARIABLE".to_string());

        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn defaults_are_valid() {
        SlurmConfig::new("infai_1", "normal", "3872M")
            .validate()
            .expect("defaults should validate");
    }
}
