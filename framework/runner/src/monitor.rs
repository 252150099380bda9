use gust_core::prelude::{DelegatedShutdownListener, ShutdownHandle};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Percentage of the available CPU above which the load generator is considered to distort its own
/// measurements.
const HIGH_CPU_USAGE: f32 = 80.0;

/// Watches the resource usage of this worker process while a benchmark runs. Stops when dropped.
pub(crate) struct Monitor {
    stop: ShutdownHandle,
}

impl Monitor {
    /// Monitor the resource usage of the worker process and report high usage.
    ///
    /// Note that this won't stop the benchmark, it will just log a warning so that the user knows
    /// their results might be affected by the load generator itself.
    ///
    /// The CPU usage for the process is collected every [sysinfo::MINIMUM_CPU_UPDATE_INTERVAL] and
    /// checked against the number of cores.
    pub(crate) fn start(benchmark: &str) -> Self {
        let stop = ShutdownHandle::new();
        let listener = stop.new_listener();
        let benchmark = benchmark.to_string();

        let spawned = std::thread::Builder::new()
            .name("monitor".to_string())
            .spawn(move || watch(&benchmark, listener));
        if let Err(e) = spawned {
            log::warn!("Failed to start monitor thread, resource usage will not be checked: {e}");
        }

        Self { stop }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop.shutdown();
    }
}

fn watch(benchmark: &str, shutdown_listener: DelegatedShutdownListener) {
    let this_process_pid = Pid::from_u32(std::process::id());
    let mut sys = System::new();

    sys.refresh_cpu_all();
    let cpu_count = sys.cpus().len().max(1);

    loop {
        if shutdown_listener.should_shutdown() {
            break;
        }

        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[this_process_pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu(),
        );

        let Some(process) = sys.process(this_process_pid) else {
            log::debug!("Process info is not available, stopping the monitor");
            break;
        };

        let usage = (process.cpu_usage() / (cpu_count * 100) as f32) * 100.0;
        if usage > HIGH_CPU_USAGE {
            log::warn!(
                "High CPU usage detected while running {benchmark}. This worker is using {usage:.2}% of the CPU, with {cpu_count} available cores"
            );
        }

        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    }
}
