// SPDX-License-Identifier: Apache-2.0

//! Shared-memory inspection and administration tool.
//!
//! Attaches to the tables of a node-local instance as an observer and
//! prints their contents, or drives the runtime mask controller:
//!
//! ```text
//! dynres_shm list                   # registered processes and masks
//! dynres_shm cpus                   # per-CPU ownership table
//! dynres_shm stats                  # usage statistics
//! dynres_shm set-mask <pid> <mask>  # rewrite a process mask
//! dynres_shm remove <pid>           # clean up after a dead process
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use clap::{Parser, Subcommand};
use dynres_config::Options;
use dynres_core::drom::{DromController, SetMaskMode};
use dynres_core::error::Error;
use dynres_core::stats::StatsReader;
use dynres_shmem::cpuinfo::CpuState;
use dynres_shmem::{CpuSet, ProcessId, NO_PROCESS};

#[derive(Parser)]
#[command(name = "dynres_shm", about = "Inspect and administer dynres shared memory", version)]
struct Cli {
    /// Instance key; defaults to the per-user key.
    #[arg(long)]
    shm_key: Option<String>,

    /// Instance color, for jobs partitioned into groups.
    #[arg(long, default_value_t = 0)]
    color: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered processes and their masks.
    List,
    /// Print the per-CPU ownership table.
    Cpus,
    /// Print usage statistics per process and per CPU.
    Stats,
    /// Rewrite the mask of a running process.
    SetMask {
        /// Target process id.
        pid: ProcessId,
        /// New mask, e.g. `0-3,8`.
        mask: CpuSet,
        /// Wait until the target adopts the mask.
        #[arg(long)]
        sync: bool,
    },
    /// Deregister a process that is gone, returning stolen CPUs.
    Remove {
        /// Target process id.
        pid: ProcessId,
    },
}

fn options_from(cli: &Cli) -> Options {
    let mut options = Options::from_env().unwrap_or_default();
    if let Some(key) = &cli.shm_key {
        options.shm_key = key.clone();
    }
    if cli.color != 0 {
        options.lewi_color = cli.color;
    }
    options
}

fn pid_or_dash(pid: ProcessId) -> String {
    if pid == NO_PROCESS {
        "-".to_owned()
    } else {
        pid.to_string()
    }
}

fn state_label(state: CpuState) -> &'static str {
    match state {
        CpuState::Disabled => "disabled",
        CpuState::Lent => "lent",
        CpuState::Busy => "busy",
    }
}

fn run(cli: &Cli) -> Result<(), Error> {
    let options = options_from(cli);
    match &cli.command {
        Command::List => {
            let stats = StatsReader::attach(&options)?;
            println!("{:>8}  {:>10}  {:>10}  {:>10}  dirty", "pid", "mask", "future", "stolen");
            for proc_rec in stats.process_snapshot()? {
                println!(
                    "{:>8}  {:>10}  {:>10}  {:>10}  {}",
                    proc_rec.pid,
                    proc_rec.registered_mask.to_string(),
                    proc_rec.future_mask.to_string(),
                    proc_rec.stolen_mask.to_string(),
                    if proc_rec.dirty { "yes" } else { "no" },
                );
            }
            stats.detach()?;
        }
        Command::Cpus => {
            let stats = StatsReader::attach(&options)?;
            println!("{:>4}  {:>8}  {:>8}  {:>8}  waiters", "cpu", "owner", "guest", "state");
            for cpu in stats.cpu_snapshot()? {
                let waiters = cpu
                    .waiters
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                println!(
                    "{:>4}  {:>8}  {:>8}  {:>8}  {}",
                    cpu.cpuid,
                    pid_or_dash(cpu.owner),
                    pid_or_dash(cpu.guest),
                    state_label(cpu.state),
                    waiters,
                );
            }
            stats.detach()?;
        }
        Command::Stats => {
            let stats = StatsReader::attach(&options)?;
            println!("node usage: {} ns", stats.node_usage()?);
            println!("{:>8}  {:>14}  {:>14}  {:>6}  load 1/5/15m", "pid", "usage ns", "avg ns/s", "cpus");
            for (pid, usage) in stats.cpu_usage_list()? {
                let load = stats.load_avg(pid)?;
                println!(
                    "{:>8}  {:>14}  {:>14}  {:>6}  {:.2}/{:.2}/{:.2}",
                    pid,
                    usage,
                    stats.cpu_avg_usage(pid)?,
                    stats.active_cpus(pid)?,
                    load[0],
                    load[1],
                    load[2],
                );
            }
            println!();
            println!("{:>4}  {:>9}  {:>9}  {:>9}", "cpu", "busy", "lent", "disabled");
            for cpuid in 0..stats.num_cpus()? as usize {
                println!(
                    "{:>4}  {:>8.1}%  {:>8.1}%  {:>8.1}%",
                    cpuid,
                    stats.cpu_state_fraction(cpuid, CpuState::Busy)? * 100.0,
                    stats.cpu_state_fraction(cpuid, CpuState::Lent)? * 100.0,
                    stats.cpu_state_fraction(cpuid, CpuState::Disabled)? * 100.0,
                );
            }
            stats.detach()?;
        }
        Command::SetMask { pid, mask, sync } => {
            let controller = DromController::attach(&options)?;
            let mode = if *sync { SetMaskMode::Sync } else { SetMaskMode::Async };
            let outcome = controller.set_process_mask(*pid, mask, mode)?;
            println!("mask update for {pid}: {outcome:?}");
            controller.detach()?;
        }
        Command::Remove { pid } => {
            let controller = DromController::attach(&options)?;
            controller.post_finalize(*pid, true)?;
            println!("removed process {pid}");
            controller.detach()?;
        }
    }
    Ok(())
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dynres_shm: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}
