//! Demo multi-vCPU scheduler daemon.
//!
//! Wires a synthetic "translated slice" workload into the real
//! [`qsync::driver::VcpuDriver`] loop across OS threads so the barrier,
//! the settle loop, and idle reconciliation all run exactly as they would
//! inside a real dynamic-binary-translation emulator, then persists the
//! per-vCPU stats and wait-time histograms an embedding emulator would
//! consume.

mod executor;
mod reporter;
mod scheduler;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use scheduler::{SchedulerRun, SchedulerRunConfig};

/// qsync-demo — multi-vCPU scheduler demo driven by a synthetic workload.
#[derive(Parser)]
#[command(name = "qsync-demo", version, about)]
struct Cli {
    /// Number of simulated vCPUs.
    #[arg(long, default_value = "4")]
    vcpus: u64,

    /// Target instructions per quantum.
    #[arg(long, default_value = "1000")]
    quantum_size: u64,

    /// Optional check period; must be a positive multiple of `quantum_size`.
    #[arg(long)]
    check_period: Option<u64>,

    /// Inclusive `"lo-hi"` participation range; omit for "all vCPUs".
    #[arg(long)]
    participation_range: Option<String>,

    /// Honor the nearest-deadline hint when sizing a generation's budget.
    #[arg(long)]
    respect_deadline: bool,

    /// Directory persisted stats CSVs and histogram dumps are written to.
    #[arg(long, default_value = "./qsync_demo_output")]
    output_dir: PathBuf,

    /// Instructions consumed per translated slice.
    #[arg(long, default_value = "100")]
    slice_cost: u32,

    /// One slice in this many raises an atomic-step exception.
    #[arg(long, default_value = "17")]
    atomic_every: u32,

    /// One slice in this many triggers a simulated host-I/O idle wait.
    #[arg(long, default_value = "31")]
    idle_every: u32,

    /// Duration of each simulated idle wait, in milliseconds.
    #[arg(long, default_value = "2")]
    idle_millis: u64,

    /// Number of slices each vCPU runs before unplugging.
    #[arg(long, default_value = "500")]
    total_slices: u32,

    /// Interval between periodic barrier progress reports, in milliseconds.
    #[arg(long, default_value = "500")]
    report_interval_millis: u64,
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let run_config = SchedulerRunConfig {
        vcpu_count: cli.vcpus,
        quantum_size: cli.quantum_size,
        check_period: cli.check_period,
        participation_range: cli.participation_range,
        respect_deadline: cli.respect_deadline,
        output_dir: cli.output_dir,
        slice_cost: cli.slice_cost,
        atomic_every: cli.atomic_every,
        idle_every: cli.idle_every,
        idle_duration: Duration::from_millis(cli.idle_millis),
        total_slices: cli.total_slices,
        report_interval: Duration::from_millis(cli.report_interval_millis),
    };

    let result = SchedulerRun::new(run_config).and_then(|mut run| run.run());

    if let Err(e) = result {
        tracing::error!("demo run failed: {e}");
        std::process::exit(1);
    }
}
