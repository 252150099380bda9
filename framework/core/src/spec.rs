use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Arguments passed explicitly to every hook and unit invocation.
pub type Args = BTreeMap<String, String>;

const RUN_ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Generate a run identifier which is also a valid cluster object name.
pub fn new_run_id() -> String {
    format!("gust-{}", nanoid::nanoid!(10, &RUN_ID_ALPHABET))
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        }
    }
}

/// Which process of the run a job hosts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    #[default]
    Coordinator,
    Worker { index: usize },
}

/// A value file to deliver into the job, destined for the release it configures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValueFile {
    pub release: String,
    pub path: PathBuf,
}

/// Identifies one end-to-end invocation.
///
/// Built once by the invoking layer and passed by value into every job of the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSpec {
    /// Unique for each run. Every object created for the run is labelled with it.
    pub run_id: String,
    pub namespace: String,
    /// Create the namespace if it does not exist yet.
    pub create_namespace: bool,
    /// Delete the namespace on teardown, only honoured if this run created it.
    pub delete_namespace: bool,
    /// The identity the job runs as. A role binding is extended with it.
    pub service_account: String,
    pub image: String,
    pub pull_policy: PullPolicy,
    /// Executable delivered into the job.
    pub artifact_path: Option<PathBuf>,
    /// Directory delivered into the job as its working directory context.
    pub context_path: Option<PathBuf>,
    /// Per-release value overrides.
    pub values: BTreeMap<String, BTreeMap<String, String>>,
    pub value_files: Vec<ValueFile>,
    pub env: BTreeMap<String, String>,
    /// Stored in a secret object. No secret is created when empty.
    pub secrets: BTreeMap<String, String>,
    pub timeout_s: u64,
    pub skip_teardown: bool,
    pub role: ProcessRole,
}

impl RunSpec {
    pub fn new(image: impl Into<String>) -> Self {
        let run_id = new_run_id();
        Self {
            namespace: run_id.clone(),
            run_id,
            create_namespace: true,
            delete_namespace: true,
            service_account: "gust".to_string(),
            image: image.into(),
            pull_policy: PullPolicy::default(),
            artifact_path: None,
            context_path: None,
            values: BTreeMap::new(),
            value_files: Vec::new(),
            env: BTreeMap::new(),
            secrets: BTreeMap::new(),
            timeout_s: 600,
            skip_teardown: false,
            role: ProcessRole::Coordinator,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    /// The name of the job record backing this process of the run.
    pub fn job_name(&self) -> String {
        match self.role {
            ProcessRole::Coordinator => format!("{}-coordinator", self.run_id),
            ProcessRole::Worker { index } => format!("{}-worker-{}", self.run_id, index),
        }
    }

    /// Derive the spec for the coordinator's job.
    pub fn for_coordinator(&self) -> Self {
        Self {
            role: ProcessRole::Coordinator,
            ..self.clone()
        }
    }

    /// Derive the spec for a worker job.
    ///
    /// Workers share the coordinator's namespace, so they never create or delete it.
    pub fn for_worker(&self, index: usize) -> Self {
        Self {
            create_namespace: false,
            delete_namespace: false,
            role: ProcessRole::Worker { index },
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Test,
    Benchmark,
}

/// Suite specific configuration, read by every process of the run at start-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SuiteConfig {
    pub mode: RunMode,
    /// Suite name patterns. A suite is selected if any pattern matches, all are selected when empty.
    pub suites: Vec<String>,
    /// Test or benchmark name patterns, with the same matching rules as [SuiteConfig::suites].
    pub tests: Vec<String>,
    pub workers: usize,
    /// Concurrent test executions, or concurrent callers per worker for benchmarks.
    pub parallelism: usize,
    /// Measured calls per worker before a benchmark stops, `0` for no limit.
    pub iterations: u64,
    /// Measured seconds before a benchmark stops, `0` for no limit.
    pub duration_s: u64,
    pub warmup_s: u64,
    pub report_interval_s: u64,
    pub batch_size: usize,
    pub args: Args,
    pub timeout_s: u64,
    pub skip_teardown: bool,
    pub verbose: bool,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Test,
            suites: Vec::new(),
            tests: Vec::new(),
            workers: 1,
            parallelism: 1,
            iterations: 0,
            duration_s: 0,
            warmup_s: 0,
            report_interval_s: 5,
            batch_size: 128,
            args: Args::new(),
            timeout_s: 600,
            skip_teardown: false,
            verbose: false,
        }
    }
}

impl SuiteConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_s)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_s)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_s)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("At least one worker is required");
        }
        if self.parallelism == 0 {
            anyhow::bail!("Parallelism must be at least 1");
        }
        if self.batch_size < 2 {
            anyhow::bail!("Batch size must be at least 2, got {}", self.batch_size);
        }
        if self.mode == RunMode::Benchmark && self.report_interval_s == 0 {
            anyhow::bail!("Benchmarks require a report interval");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn run_id_is_object_name_safe() {
        let id = new_run_id();
        assert!(id.starts_with("gust-"));
        assert!(id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn worker_spec_never_owns_namespace() {
        let spec = RunSpec::new("registry/suite:latest");
        let worker = spec.for_worker(3);

        assert!(!worker.create_namespace);
        assert!(!worker.delete_namespace);
        assert_eq!(format!("{}-worker-3", spec.run_id), worker.job_name());
        assert_eq!(format!("{}-coordinator", spec.run_id), spec.job_name());
    }

    #[test]
    fn suite_config_defaults_fill_missing_fields() {
        let config: SuiteConfig =
            serde_json::from_str(r#"{"suites": ["MapSuite"], "workers": 2}"#).unwrap();

        assert_eq!(vec!["MapSuite".to_string()], config.suites);
        assert_eq!(2, config.workers);
        assert_eq!(RunMode::Test, config.mode);
        config.validate().unwrap();
    }

    #[test]
    fn reject_zero_workers() {
        let config = SuiteConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
