use std::path::PathBuf;
use std::time::Duration;

/// Key of the run specification document in a job's config object.
pub const RUN_SPEC_KEY: &str = "run-spec.json";

/// Key of the suite configuration document in a job's config object.
pub const SUITE_CONFIG_KEY: &str = "suite-config.json";

/// Settings for talking to the cluster, constructed once and shared by every job of a run.
///
/// Paths are inside the job's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSettings {
    /// Interval between polls of a job's process state.
    pub poll_interval: Duration,
    pub container: String,
    /// Label binding every object to its run.
    pub label_key: String,
    pub cluster_role: String,
    /// Cluster-scoped binding shared by every run, extended with each run's identity.
    pub role_binding: String,
    pub artifact_dir: PathBuf,
    pub context_dir: PathBuf,
    pub values_dir: PathBuf,
    /// Where the config object is mounted.
    pub config_dir: PathBuf,
    /// Written once artifacts are delivered. The process waits for it before reading its config.
    pub ready_sentinel: PathBuf,
    /// Written to ask the process to exit.
    pub shutdown_sentinel: PathBuf,
    /// Fresh deadline for teardown stages, which are not cancelled with the run.
    pub teardown_timeout: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            container: "gust".to_string(),
            label_key: "gust.io/run-id".to_string(),
            cluster_role: "gust".to_string(),
            role_binding: "gust".to_string(),
            artifact_dir: PathBuf::from("/gust/bin"),
            context_dir: PathBuf::from("/gust/context"),
            values_dir: PathBuf::from("/gust/values"),
            config_dir: PathBuf::from("/gust/config"),
            ready_sentinel: PathBuf::from("/gust/ready"),
            shutdown_sentinel: PathBuf::from("/gust/shutdown"),
            teardown_timeout: Duration::from_secs(60),
        }
    }
}

impl ClusterSettings {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_teardown_timeout(mut self, teardown_timeout: Duration) -> Self {
        self.teardown_timeout = teardown_timeout;
        self
    }

    pub fn with_role_binding(mut self, name: impl Into<String>) -> Self {
        self.role_binding = name.into();
        self
    }
}
