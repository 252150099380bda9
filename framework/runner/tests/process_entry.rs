use std::path::Path;
use std::sync::Arc;

use gust_cluster::prelude::{RUN_SPEC_KEY, SUITE_CONFIG_KEY};
use gust_core::prelude::{DelegatedShutdownListener, RunSpec, EXIT_CODE_SUCCESS};
use gust_runner::prelude::{
    run, Catalog, GustProcessCli, GustResult, RoleArg, SuiteConfig, Worker, WorkerTransport,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

/// Remembers which worker it was asked to serve and returns straight away.
#[derive(Default)]
struct RecordingTransport {
    served: Mutex<Vec<usize>>,
}

impl WorkerTransport for RecordingTransport {
    fn serve(&self, worker: Arc<Worker>, _shutdown: DelegatedShutdownListener) -> GustResult<()> {
        self.served.lock().push(worker.index());
        Ok(())
    }
}

fn cli(dir: &Path, role: RoleArg) -> GustProcessCli {
    GustProcessCli {
        config_dir: dir.to_path_buf(),
        ready_sentinel: dir.join("ready"),
        shutdown_sentinel: dir.join("shutdown"),
        role,
        worker_index: 2,
    }
}

#[test]
fn coordinator_role_is_rejected() {
    // No ready sentinel, so the process would wait forever if it got that far.
    let dir = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::default();

    let err = run(Catalog::new(), &cli(dir.path(), RoleArg::Coordinator), &transport).unwrap_err();

    assert!(err.to_string().contains("coordinator"));
    assert!(transport.served.lock().is_empty());
}

#[test]
fn worker_serves_once_ready() {
    let dir = tempfile::tempdir().unwrap();
    let config = SuiteConfig {
        timeout_s: 30,
        ..Default::default()
    };
    std::fs::write(
        dir.path().join(RUN_SPEC_KEY),
        serde_json::to_string(&RunSpec::new("image")).unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.path().join(SUITE_CONFIG_KEY),
        serde_json::to_string(&config).unwrap(),
    )
    .unwrap();
    std::fs::write(dir.path().join("ready"), "").unwrap();
    let transport = RecordingTransport::default();

    let exit_code = run(Catalog::new(), &cli(dir.path(), RoleArg::Worker), &transport).unwrap();

    assert_eq!(EXIT_CODE_SUCCESS, exit_code);
    assert_eq!(vec![2], *transport.served.lock());
}
