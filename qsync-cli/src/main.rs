//! CLI for validating quantum configurations and running in-process
//! `qsync` simulations.
//!
//! One subcommand per offline operation an operator needs against a
//! quantum configuration, none of which require a live emulator.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use clap::{Parser, Subcommand};
use qsync::QuantumAccount;
use qsync::barrier::DynamicBarrier;
use qsync::config::{IdlePolicy, QuantumConfig};
use qsync::driver::{ExceptionCode, Executor, ExitReason, VcpuDriver};

/// qsync — quantum-synchronized virtual-time scheduler CLI.
#[derive(Parser)]
#[command(name = "qsync", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Validate a quantum configuration without running anything.
    Validate {
        /// Target instructions per quantum.
        #[arg(long)]
        quantum_size: u64,

        /// Optional check period; must be a positive multiple of `quantum_size`.
        #[arg(long)]
        check_period: Option<u64>,

        /// Participation range as "lo-hi" (inclusive vCPU indices).
        #[arg(long)]
        participation_range: Option<String>,

        /// Path to a CSV table of per-vCPU `ipc,affinity_core_idx` rows.
        #[arg(long)]
        ipc_table: Option<PathBuf>,

        /// Respect the deadline-source hint when computing release budgets.
        #[arg(long)]
        respect_deadline: bool,

        /// Idle-reconciliation policy.
        #[arg(long, value_enum, default_value = "peek-peers")]
        idle_policy: IdlePolicyArg,

        /// Emit the validated configuration as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },

    /// Run an in-process multi-vCPU simulation with a synthetic executor.
    Simulate {
        /// Target instructions per quantum.
        #[arg(long, default_value = "1000")]
        quantum_size: u64,

        /// Number of simulated vCPUs.
        #[arg(long, default_value = "2")]
        vcpus: u64,

        /// Instructions consumed per translated slice.
        #[arg(long, default_value = "100")]
        slice_cost: u32,

        /// Number of slices each vCPU runs before unplugging.
        #[arg(long, default_value = "20")]
        slices: u32,
    },

    /// Summarize a persisted per-vCPU quantum-stats CSV.
    Inspect {
        /// Path to the quantum-stats CSV written by a driver run.
        path: PathBuf,

        /// Emit the summary as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
}

/// `clap`-facing mirror of [`IdlePolicy`].
#[derive(Clone, Copy, clap::ValueEnum)]
enum IdlePolicyArg {
    /// Deduct real elapsed time from the next quantum directly.
    DeductRealTime,
    /// Adopt the average of in-generation peer budgets.
    PeekPeers,
}

impl From<IdlePolicyArg> for IdlePolicy {
    fn from(arg: IdlePolicyArg) -> Self {
        match arg {
            IdlePolicyArg::DeductRealTime => IdlePolicy::DeductRealTime,
            IdlePolicyArg::PeekPeers => IdlePolicy::PeekPeers,
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate {
            quantum_size,
            check_period,
            participation_range,
            ipc_table,
            respect_deadline,
            idle_policy,
            json,
        } => cmd_validate(
            quantum_size,
            check_period,
            participation_range,
            ipc_table,
            respect_deadline,
            idle_policy,
            json,
        ),
        Commands::Simulate {
            quantum_size,
            vcpus,
            slice_cost,
            slices,
        } => cmd_simulate(quantum_size, vcpus, slice_cost, slices),
        Commands::Inspect { path, json } => cmd_inspect(&path, json),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `qsync validate`.
fn cmd_validate(
    quantum_size: u64,
    check_period: Option<u64>,
    participation_range: Option<String>,
    ipc_table: Option<PathBuf>,
    respect_deadline: bool,
    idle_policy: IdlePolicyArg,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = QuantumConfig::builder()
        .quantum_size(quantum_size)
        .respect_deadline(respect_deadline)
        .idle_policy(idle_policy.into());

    if let Some(period) = check_period {
        builder = builder.check_period(period);
    }
    if let Some(range) = participation_range {
        builder = builder.participation_range(range);
    }
    if let Some(path) = &ipc_table {
        let csv = std::fs::read_to_string(path)?;
        builder = builder.per_cpu_ipc_table(csv);
    }

    let config = builder.build()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("Configuration valid:");
        println!("  quantum_size:       {}", config.quantum_size());
        println!("  check_period:       {:?}", config.check_period());
        println!("  respect_deadline:   {}", config.respect_deadline());
        println!("  idle_policy:        {:?}", config.idle_policy());
    }
    Ok(())
}

/// A synthetic executor for `qsync simulate`: every slice deducts a fixed
/// instruction cost, and the vCPU unplugs after a fixed slice count.
struct FixedSliceExecutor {
    accounts: Arc<[QuantumAccount]>,
    slice_cost: u32,
    slices_remaining: Vec<AtomicU32>,
    slices_run: AtomicUsize,
}

impl Executor for FixedSliceExecutor {
    fn run_slice(&self, vcpu_idx: u64) -> ExceptionCode {
        self.slices_run.fetch_add(1, Ordering::Relaxed);
        let account = &self.accounts[vcpu_idx as usize];
        account.set_required(self.slice_cost);
        account.helper_check_and_deduct();
        ExceptionCode::Normal
    }

    fn step_atomic(&self, _vcpu_idx: u64) {}

    fn wait_io_event(&self, _vcpu_idx: u64, _first_time: bool) -> bool {
        false
    }

    fn handle_debug(&self, _vcpu_idx: u64) {}

    fn should_unplug(&self, vcpu_idx: u64) -> bool {
        self.slices_remaining[vcpu_idx as usize].fetch_sub(1, Ordering::Relaxed) == 1
    }
}

/// Implements `qsync simulate`.
fn cmd_simulate(
    quantum_size: u64,
    vcpu_count: u64,
    slice_cost: u32,
    slices: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let range = format!("0-{}", vcpu_count.saturating_sub(1));
    let config = Arc::new(
        QuantumConfig::builder()
            .quantum_size(quantum_size)
            .participation_range(range)
            .build()?,
    );
    let barrier = Arc::new(DynamicBarrier::with_generation_budget(quantum_size));
    let accounts: Arc<[QuantumAccount]> =
        Arc::from((0..vcpu_count).map(|_| QuantumAccount::new(1)).collect::<Vec<_>>());

    let executor = Arc::new(FixedSliceExecutor {
        accounts: Arc::clone(&accounts),
        slice_cost,
        slices_remaining: (0..vcpu_count).map(|_| AtomicU32::new(slices)).collect(),
        slices_run: AtomicUsize::new(0),
    });

    println!(
        "Simulating {vcpu_count} vCPU(s), quantum_size={quantum_size}, slice_cost={slice_cost}, slices={slices}"
    );

    let results: Vec<(u64, ExitReason)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..vcpu_count)
            .map(|idx| {
                let config = Arc::clone(&config);
                let barrier = Arc::clone(&barrier);
                let accounts = Arc::clone(&accounts);
                let executor = Arc::clone(&executor);
                scope.spawn(move || {
                    let mut driver = VcpuDriver::new(idx, config, barrier, accounts);
                    let reason = driver.run(executor.as_ref());
                    (idx, reason)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (idx, reason) in &results {
        println!("  vCPU {idx}: {reason:?}");
    }
    println!("Barrier reached generation {}", barrier.generation());
    println!(
        "Total slices executed across all vCPUs: {}",
        executor.slices_run.load(Ordering::Relaxed)
    );

    if results.iter().any(|(_, r)| matches!(r, ExitReason::TranslatorAborted(_))) {
        return Err("one or more vCPUs aborted".into());
    }
    Ok(())
}

/// Implements `qsync inspect`.
fn cmd_inspect(path: &PathBuf, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let mut lines = text.lines();

    let summary_header = lines.next().ok_or("empty stats file")?;
    let summary_values = lines.next().ok_or("missing summary row")?;
    let rows_header = lines.next().ok_or("missing row header")?;

    let mut row_count = 0u64;
    let mut total_wait = 0u64;
    for line in lines.by_ref() {
        if line == "total_icount,exclusive_icount" {
            break;
        }
        let fields: Vec<_> = line.split(',').collect();
        if fields.len() != 5 {
            continue;
        }
        row_count += 1;
        total_wait += fields[2].parse::<u64>().unwrap_or(0);
    }

    if json {
        let output = serde_json::json!({
            "summary_header": summary_header,
            "summary_values": summary_values,
            "rows_header": rows_header,
            "row_count": row_count,
            "total_waiting_time_nanos": total_wait,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Summary ({summary_header}):");
        println!("  {summary_values}");
        println!();
        println!("Per-quantum rows ({rows_header}):");
        println!("  {row_count} quanta recorded, {total_wait} ns total waiting time");
    }
    Ok(())
}
