//! Wires a synthetic workload into the real `qsync` barrier and driver
//! loop across OS threads.
//!
//! One `new()` builds the shared state; one `run()` spawns the side
//! threads and then blocks until every vCPU thread exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use qsync::QuantumAccount;
use qsync::barrier::DynamicBarrier;
use qsync::config::QuantumConfig;
use qsync::driver::{ExitReason, VcpuDriver};
use qsync::error::QSyncError;

use crate::executor::SyntheticExecutor;
use crate::reporter;

/// Run configuration, the fields a `clap::Parser` CLI turns into a
/// [`SchedulerRun`].
pub struct SchedulerRunConfig {
    /// Number of simulated vCPUs.
    pub vcpu_count: u64,
    /// Target instructions per quantum.
    pub quantum_size: u64,
    /// Optional check period validated against `quantum_size`.
    pub check_period: Option<u64>,
    /// Inclusive `"lo-hi"` participation range; `None` means all vCPUs.
    pub participation_range: Option<String>,
    /// Whether the barrier should honor a deadline-source hint.
    pub respect_deadline: bool,
    /// Directory persisted stats CSVs and the histogram dump are written to.
    pub output_dir: PathBuf,
    /// Instructions consumed per translated slice.
    pub slice_cost: u32,
    /// One slice in this many raises an atomic-step exception.
    pub atomic_every: u32,
    /// One slice in this many triggers a host-I/O idle wait.
    pub idle_every: u32,
    /// Duration of each simulated idle wait.
    pub idle_duration: Duration,
    /// Number of slices each vCPU runs before unplugging.
    pub total_slices: u32,
    /// Interval between periodic barrier progress reports.
    pub report_interval: Duration,
}

/// Errors that can occur while building or running a [`SchedulerRun`].
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The quantum configuration failed validation.
    #[error(transparent)]
    Config(#[from] QSyncError),
    /// A side thread (reporter or per-vCPU driver) could not be spawned.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),
    /// A vCPU driver thread aborted.
    #[error("vCPU {vcpu_idx} aborted: {reason}")]
    VcpuAborted {
        /// The aborting vCPU's index.
        vcpu_idx: u64,
        /// The translator's abort message.
        reason: String,
    },
}

/// Owns the shared barrier, per-vCPU accounts, and output directory for
/// one demo run.
pub struct SchedulerRun {
    config: Arc<QuantumConfig>,
    barrier: Arc<DynamicBarrier>,
    accounts: Arc<[QuantumAccount]>,
    vcpu_count: u64,
    output_dir: PathBuf,
    executor: Arc<SyntheticExecutor>,
    report_interval: Duration,
}

impl SchedulerRun {
    /// Builds the shared barrier, per-vCPU accounts, and synthetic
    /// executor for `run_config`.
    pub fn new(run_config: SchedulerRunConfig) -> Result<Self, SchedulerError> {
        let mut builder = QuantumConfig::builder()
            .quantum_size(run_config.quantum_size)
            .respect_deadline(run_config.respect_deadline);
        if let Some(period) = run_config.check_period {
            builder = builder.check_period(period);
        }
        if let Some(range) = run_config.participation_range {
            builder = builder.participation_range(range);
        }
        let config = Arc::new(builder.build().map_err(QSyncError::from)?);

        let barrier = Arc::new(DynamicBarrier::with_generation_budget(run_config.quantum_size));
        let accounts: Arc<[QuantumAccount]> = Arc::from(
            (0..run_config.vcpu_count)
                .map(|idx| QuantumAccount::new(config.ipc_for(idx)))
                .collect::<Vec<_>>(),
        );

        let executor = Arc::new(SyntheticExecutor::new(
            Arc::clone(&accounts),
            run_config.vcpu_count,
            run_config.slice_cost,
            run_config.atomic_every,
            run_config.idle_every,
            run_config.idle_duration,
            run_config.total_slices,
        ));

        std::fs::create_dir_all(&run_config.output_dir).map_err(SchedulerError::Spawn)?;

        Ok(Self {
            config,
            barrier,
            accounts,
            vcpu_count: run_config.vcpu_count,
            output_dir: run_config.output_dir,
            executor,
            report_interval: run_config.report_interval,
        })
    }

    /// Spawns the reporter thread and one driver thread per vCPU, then
    /// blocks until every vCPU thread exits. Writes each vCPU's persisted
    /// stats CSV and wait-time histogram to `output_dir`.
    pub fn run(&mut self) -> Result<(), SchedulerError> {
        let stop = Arc::new(AtomicBool::new(false));
        let reporter_barrier = Arc::clone(&self.barrier);
        let reporter_stop = Arc::clone(&stop);
        let report_interval = self.report_interval;
        let reporter_handle = std::thread::Builder::new()
            .name("barrier-reporter".into())
            .spawn(move || reporter::run(reporter_barrier, report_interval, reporter_stop))
            .map_err(SchedulerError::Spawn)?;

        let results: Vec<(u64, ExitReason, Option<usize>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.vcpu_count)
                .map(|idx| {
                    let config = Arc::clone(&self.config);
                    let barrier = Arc::clone(&self.barrier);
                    let accounts = Arc::clone(&self.accounts);
                    let executor = Arc::clone(&self.executor);
                    let histogram = qsync::TimeHistogram::new(32, 0, 1_000_000);
                    scope.spawn(move || {
                        let mut driver =
                            VcpuDriver::new(idx, config, barrier, accounts).with_histogram(histogram);
                        let reason = driver.run(executor.as_ref());
                        (idx, reason, driver.histogram_index(), driver.stats().render())
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().expect("vcpu driver thread panicked"))
                .map(|(idx, reason, histogram_index, rendered)| {
                    let path = self.output_dir.join(format!("quantum_stats_{idx}.csv"));
                    if let Err(e) = std::fs::write(&path, rendered) {
                        tracing::warn!(vcpu = idx, "failed to write quantum stats: {e}");
                    }
                    (idx, reason, histogram_index)
                })
                .collect()
        });

        stop.store(true, Ordering::Relaxed);
        reporter_handle.join().expect("reporter thread panicked");

        for (idx, _, histogram_index) in &results {
            let Some(index) = histogram_index else { continue };
            if let Some(rendered) = self.barrier.render_histogram(*index) {
                let path = self.output_dir.join(format!("wait_histogram_{idx}.txt"));
                if let Err(e) = std::fs::write(&path, rendered) {
                    tracing::warn!(vcpu = idx, "failed to write wait histogram: {e}");
                }
            }
        }

        self.write_barrier_summary()?;

        for (idx, reason, _) in &results {
            if let ExitReason::TranslatorAborted(reason) = reason {
                return Err(SchedulerError::VcpuAborted {
                    vcpu_idx: *idx,
                    reason: reason.clone(),
                });
            }
        }

        tracing::info!(
            generation = self.barrier.generation(),
            system_target_time = self.barrier.current_system_target_time(),
            total_idle_nanos = self.executor.total_idle_nanos(),
            "demo run complete"
        );
        Ok(())
    }

    fn write_barrier_summary(&self) -> Result<(), SchedulerError> {
        let summary = serde_json::json!({
            "generation": self.barrier.generation(),
            "system_target_time": self.barrier.current_system_target_time(),
            "total_wait_time_nanos": self.barrier.total_wait_time().as_nanos() as u64,
        });
        let path = self.output_dir.join("barrier_summary.json");
        std::fs::write(&path, serde_json::to_string_pretty(&summary).unwrap_or_default())
            .map_err(SchedulerError::Spawn)
    }
}
