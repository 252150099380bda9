use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use gust_core::prelude::{BenchProgress, Report, RunRequest};
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;

use crate::folder::Folder;

/// The function under load. Called concurrently from every caller thread.
pub type BenchTarget = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchState {
    Idle,
    Warming,
    Running,
    Stopped,
}

impl BenchState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BenchState::Idle,
            1 => BenchState::Warming,
            2 => BenchState::Running,
            _ => BenchState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchSettings {
    /// Number of concurrent callers.
    pub parallelism: usize,
    /// Results are discarded for this long after starting.
    pub warmup: Duration,
    /// Stop after this many measured calls, `0` for no limit.
    pub iterations: u64,
    /// Stop after measuring for this long, zero for no limit.
    pub duration: Duration,
    pub batch_size: usize,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            parallelism: 1,
            warmup: Duration::ZERO,
            iterations: 0,
            duration: Duration::ZERO,
            batch_size: 128,
        }
    }
}

impl BenchSettings {
    pub fn from_request(request: &RunRequest) -> Self {
        Self {
            parallelism: request.parallelism.max(1),
            warmup: request.bench.warmup,
            iterations: request.bench.iterations,
            duration: request.bench.duration,
            batch_size: request.bench.batch_size,
        }
    }
}

struct Sample {
    elapsed: Duration,
    is_error: bool,
}

/// A one-way stop flag that threads can sleep on until a deadline.
#[derive(Default)]
struct StopSignal {
    stopped: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        let _guard = self.lock.lock();
        self.stopped.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Sleep until stopped or until `deadline`. Returns whether the signal was stopped.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut guard = self.lock.lock();
        while !self.is_stopped() {
            if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                return self.is_stopped();
            }
        }
        true
    }
}

/// Shared between the caller threads, the folder thread and the clock thread.
struct Shared {
    state: AtomicU8,
    finished: AtomicBool,
    measured: AtomicU64,
    folder: Mutex<Folder>,
    failure: Mutex<Option<String>>,
    stop: StopSignal,
}

impl Shared {
    fn state(&self) -> BenchState {
        BenchState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BenchState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// One benchmark running on this worker: concurrent callers generating load against a target,
/// with call durations streamed to a background folder.
pub struct Benchmark {
    name: String,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl Benchmark {
    /// Start calling `target` with the configured concurrency.
    ///
    /// Moves through warming, if a warm-up is configured, to running. The benchmark keeps running
    /// until its iteration or duration budget is used up, or until [Benchmark::stop] is called.
    pub fn start(
        name: impl Into<String>,
        settings: BenchSettings,
        target: BenchTarget,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            state: AtomicU8::new(BenchState::Idle as u8),
            finished: AtomicBool::new(false),
            measured: AtomicU64::new(0),
            folder: Mutex::new(Folder::new(settings.batch_size)),
            failure: Mutex::new(None),
            stop: StopSignal::default(),
        });

        let start = Instant::now();
        if settings.warmup.is_zero() {
            shared.set_state(BenchState::Running);
        } else {
            shared.set_state(BenchState::Warming);
        }
        shared.folder.lock().reset_window(start);

        log::info!(
            "Starting benchmark {name} with {} callers, warm-up {:?}, iterations {}, duration {:?}",
            settings.parallelism,
            settings.warmup,
            settings.iterations,
            settings.duration
        );

        let (sender, receiver) =
            mpsc::channel::<Sample>(settings.batch_size.max(2) * settings.parallelism.max(1));

        let mut threads = Vec::with_capacity(settings.parallelism + 2);
        let spawned = (|| {
            threads.push(spawn_folder(&name, receiver, shared.clone())?);
            threads.push(spawn_clock(&name, settings, start, shared.clone())?);
            for caller in 0..settings.parallelism.max(1) {
                threads.push(spawn_caller(
                    &name,
                    caller,
                    settings.iterations,
                    target.clone(),
                    sender.clone(),
                    shared.clone(),
                )?);
            }
            anyhow::Ok(())
        })();
        if let Err(e) = spawned {
            shared.stop.stop();
            return Err(e);
        }

        Ok(Self {
            name,
            shared,
            threads,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BenchState {
        self.shared.state()
    }

    /// Whether the iteration or duration budget has been used up.
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// The panic message of a caller, if the target panicked. The benchmark stops on a panic.
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().clone()
    }

    /// Statistics for the window since the previous report. Starts a new window.
    ///
    /// While warming up the window is empty.
    pub fn report(&self) -> BenchProgress {
        let report = self.shared.folder.lock().take_report(Instant::now());
        BenchProgress {
            report,
            finished: self.is_finished() || self.state() == BenchState::Stopped,
        }
    }

    /// Block until the budget is used up or the benchmark is stopped, at most for `timeout`.
    /// Returns whether the benchmark finished.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.shared.stop.wait_until(Instant::now() + timeout) || self.is_finished()
    }

    /// Stop the callers, drain the sample stream and return the final window.
    pub fn stop(mut self) -> Report {
        self.shared.stop.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("Benchmark {} thread panicked", self.name);
            }
        }
        self.shared.set_state(BenchState::Stopped);

        let report = self.shared.folder.lock().take_report(Instant::now());
        log::debug!("Stopped benchmark {}: {report}", self.name);
        report
    }
}

impl Drop for Benchmark {
    fn drop(&mut self) {
        // Threads exit on their own once signalled, there is no need to wait for them here.
        self.shared.stop.stop();
    }
}

fn spawn_folder(
    name: &str,
    mut receiver: mpsc::Receiver<Sample>,
    shared: Arc<Shared>,
) -> anyhow::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("{name}-folder"))
        .spawn(move || {
            let mut batch = Vec::new();
            // Ends once every caller has exited and dropped its sender.
            while let Some(sample) = receiver.blocking_recv() {
                batch.push(sample);
                while let Ok(sample) = receiver.try_recv() {
                    batch.push(sample);
                    if batch.len() >= 1024 {
                        break;
                    }
                }

                let mut folder = shared.folder.lock();
                for sample in batch.drain(..) {
                    if sample.is_error {
                        folder.record_error();
                    }
                    folder.push(sample.elapsed);
                }
            }
        })
        .context("Failed to start benchmark folder thread")
}

/// Moves the benchmark from warming to running and enforces the duration budget.
fn spawn_clock(
    name: &str,
    settings: BenchSettings,
    start: Instant,
    shared: Arc<Shared>,
) -> anyhow::Result<JoinHandle<()>> {
    let bench_name = name.to_string();
    std::thread::Builder::new()
        .name(format!("{name}-clock"))
        .spawn(move || {
            let measure_start = start + settings.warmup;

            if shared.state() == BenchState::Warming {
                if shared.stop.wait_until(measure_start) {
                    return;
                }
                log::debug!("Benchmark {bench_name} finished warming up");
                shared.folder.lock().reset_window(Instant::now());
                shared.set_state(BenchState::Running);
            }

            if settings.duration.is_zero() {
                return;
            }
            if !shared.stop.wait_until(measure_start + settings.duration) {
                log::debug!("Benchmark {bench_name} reached its duration");
                shared.finished.store(true, Ordering::Release);
                shared.stop.stop();
            }
        })
        .context("Failed to start benchmark clock thread")
}

fn spawn_caller(
    name: &str,
    caller: usize,
    iterations: u64,
    target: BenchTarget,
    sender: mpsc::Sender<Sample>,
    shared: Arc<Shared>,
) -> anyhow::Result<JoinHandle<()>> {
    let bench_name = name.to_string();
    std::thread::Builder::new()
        .name(format!("{name}-caller-{caller}"))
        .spawn(move || {
            let mut logged_error = false;

            loop {
                if shared.stop.is_stopped() {
                    break;
                }

                let started = Instant::now();
                let result = catch_unwind(AssertUnwindSafe(|| target()));
                let elapsed = started.elapsed();

                let is_error = match result {
                    Ok(Ok(())) => false,
                    Ok(Err(e)) => {
                        if !logged_error {
                            log::warn!("Benchmark {bench_name} target returned an error: {e:?}");
                            logged_error = true;
                        }
                        true
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        log::error!("Benchmark {bench_name} target panicked: {message}");
                        shared.failure.lock().get_or_insert(message);
                        shared.stop.stop();
                        break;
                    }
                };

                if shared.state() != BenchState::Running {
                    continue;
                }

                if iterations > 0 {
                    let measured = shared.measured.fetch_add(1, Ordering::AcqRel) + 1;
                    if measured > iterations {
                        break;
                    }
                    if measured == iterations {
                        log::debug!("Benchmark {bench_name} reached its iteration budget");
                        shared.finished.store(true, Ordering::Release);
                        shared.stop.stop();
                    }
                }

                if sender.blocking_send(Sample { elapsed, is_error }).is_err() {
                    break;
                }
            }
        })
        .context("Failed to start benchmark caller thread")
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
