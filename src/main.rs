// Copyright (c) The arbiterd Authors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Context;
use anyhow::Result;
use arbiterd::cpulist;
use arbiterd::poll;
use arbiterd::server::{ArbiterServer, Config};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// arbiterd: user-space core arbiter
///
/// arbiterd partitions a machine's CPU cores between cooperating processes at
/// finer granularity and lower latency than the kernel scheduler would give if
/// every process freely contended. Processes register over the listen socket,
/// declare how many cores they want at each of eight priority levels, and in
/// exchange receive exclusive access to specific physical cores, enforced
/// through a dedicated cpuset per core.
///
/// When global demand shifts, the arbiter asks a holder to vacate one core by
/// bumping a counter in the process's shared memory region. A process that
/// does not block one of its exclusive threads within the preemption timeout
/// has a thread forcibly migrated back to the unmanaged pool.
///
/// The daemon needs enough privilege to manipulate the cpuset filesystem and
/// move arbitrary tasks between cpusets, which normally means running as
/// root.
#[derive(Debug, Parser)]
struct Opts {
    /// Path of the socket clients connect to.
    #[clap(long, default_value = "/var/run/arbiterd/socket")]
    socket_path: PathBuf,

    /// Directory holding the per-process shared memory files.
    #[clap(long, default_value = "/var/run/arbiterd/shmem")]
    shmem_dir: PathBuf,

    /// Mount point of the cpuset filesystem.
    #[clap(long, default_value = "/sys/fs/cgroup/cpuset")]
    cpuset_root: PathBuf,

    /// CPUs to manage as exclusive cores, in cpulist format (e.g. "2-5,7").
    /// At least one CPU must be left out for the unmanaged pool.
    #[clap(short = 'c', long)]
    exclusive_cpus: String,

    /// Time in milliseconds a process is given to release a core voluntarily
    /// before one of its threads is forcibly preempted.
    #[clap(short = 't', long, default_value = "10")]
    preemption_timeout_ms: u64,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Print version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!("arbiterd version {}", VERSION);
        return Ok(());
    }

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let mut server = ArbiterServer::new(Config {
        socket_path: opts.socket_path,
        shmem_dir: opts.shmem_dir,
        cpuset_root: opts.cpuset_root,
        exclusive_cpus: cpulist::parse(&opts.exclusive_cpus)?,
        preemption_timeout: Duration::from_millis(opts.preemption_timeout_ms),
    })?;

    let term_fd = server.termination_fd();
    ctrlc::set_handler(move || {
        poll::notify_eventfd(term_fd);
    })
    .context("failed to set signal handler")?;

    server.run()
}
