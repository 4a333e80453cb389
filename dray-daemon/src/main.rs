//! # drayd
//!
//! Transfer scheduler of the dray file distribution system.
//!
//! The daemon takes job descriptors from the upstream generator,
//! keeps them in a priority-ordered persistent queue, and runs
//! bounded-concurrency worker processes (`sf_*`/`gf_*`) that carry
//! the files to their destinations. Retries, per-host concurrency
//! caps, transfer-rate limits, host failover, burst-mode connection
//! reuse and graceful shutdown all live here.

mod context;
mod daemon;
mod delete;
mod fifos;
mod intake;
mod lifecycle;
mod logs;
mod maintenance;
mod retrieve;
mod scheduler;
mod shutdown;
#[cfg(test)]
mod testutil;
mod worker;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use fs2::FileExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dray_config::{paths, FdConfig, WorkDir};

/// Command line arguments for the dray transfer scheduler.
#[derive(Parser, Debug)]
#[command(name = "drayd")]
#[command(about = "Transfer scheduler for the dray file distribution system")]
struct Args {
    /// Working directory holding the spool, fifos and status areas
    #[arg(short = 'w', long, env = "DRAY_WORK_DIR")]
    work_dir: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("drayd=debug,info")
                }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(&args) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<i32> {
    let workdir = WorkDir::init(&args.work_dir)
        .context("failed to set up the working directory")?;

    // One scheduler per working directory; the lock file holds our
    // pid for the operator tools.
    let mut lock = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(paths::lock_file(workdir.root()))
        .context("failed to open the lock file")?;
    if lock.try_lock_exclusive().is_err() {
        let contents =
            std::fs::read_to_string(paths::lock_file(workdir.root()))
                .unwrap_or_default();
        let holder = contents.trim();
        anyhow::bail!(
            "Process FD already started by {}",
            if holder.is_empty() { "pid unknown" } else { holder }
        );
    }
    lock.set_len(0)?;
    writeln!(lock, "{}", std::process::id())?;

    let config = FdConfig::load(workdir.root())
        .context("failed to load the configuration")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the runtime")?;

    runtime.block_on(async {
        let fd = context::Fd::new(workdir.root(), config)
            .context("failed to attach the status areas")?;
        let fifos = fifos::FifoSet::open(workdir.root())
            .context("failed to open the control fifos")?;
        daemon::run(fd, fifos).await
    })
}
