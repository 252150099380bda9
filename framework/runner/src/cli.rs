use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use gust_core::prelude::ProcessRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    Coordinator,
    Worker,
}

/// The command line of a Gust process running inside a job, coordinator or worker. Written by the
/// job provisioner.
#[derive(Debug, Clone, Parser)]
#[command(about, long_about = None)]
pub struct GustProcessCli {
    /// Directory the run specification and suite configuration are mounted into
    #[clap(long, default_value = "/gust/config")]
    pub config_dir: PathBuf,

    /// The configuration is only read once this file exists
    #[clap(long, default_value = "/gust/ready")]
    pub ready_sentinel: PathBuf,

    /// The process shuts down once this file exists
    #[clap(long, default_value = "/gust/shutdown")]
    pub shutdown_sentinel: PathBuf,

    #[clap(long, value_enum, default_value = "coordinator")]
    pub role: RoleArg,

    /// The index of this worker, ignored for the coordinator
    #[clap(long, default_value = "0")]
    pub worker_index: usize,
}

impl GustProcessCli {
    pub fn process_role(&self) -> ProcessRole {
        match self.role {
            RoleArg::Coordinator => ProcessRole::Coordinator,
            RoleArg::Worker => ProcessRole::Worker {
                index: self.worker_index,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_provisioned_arguments() {
        let cli = GustProcessCli::parse_from([
            "suite",
            "--config-dir",
            "/gust/config",
            "--ready-sentinel",
            "/gust/ready",
            "--shutdown-sentinel",
            "/gust/shutdown",
            "--role",
            "worker",
            "--worker-index",
            "3",
        ]);

        assert_eq!(ProcessRole::Worker { index: 3 }, cli.process_role());
        assert_eq!(PathBuf::from("/gust/ready"), cli.ready_sentinel);
    }
}
