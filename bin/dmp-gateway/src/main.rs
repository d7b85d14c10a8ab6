#![allow(clippy::result_large_err)]
//! dmp gateway
//!
//! Hosts one dmp virtual target: builds it from a table line, exports it over
//! NBD and publishes the statistics report to a file on an interval. The
//! `bench` subcommand drives the same target with local threads instead.

mod bench;
mod nbd;
mod publish;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use dmp_target::{DeviceMode, DmpModule, DmpTarget, MemDevice, TableLine};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::bench::BenchConfig;
use crate::nbd::NbdServer;
use crate::publish::{ReportFormat, StatsPublisher};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "dmp-gateway", about = "dmp block target host")]
struct Args {
    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Size of the RAM disk registered as "ram0" (0 disables it)
    #[arg(long, default_value_t = 64 * 1024 * 1024, global = true)]
    ramdisk_bytes: u64,

    /// Access mode for the backing device (ro / rw)
    #[arg(long, default_value = "rw", global = true)]
    mode: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Export the target over NBD
    Serve(ServeArgs),
    /// Drive the target with local reader/writer threads and print the report
    Bench(BenchArgs),
}

#[derive(Debug, ClapArgs)]
struct ServeArgs {
    /// Table line: <begin> <len> <target-type> [args...]
    #[arg(long, default_value = "0 131072 dmp ram0")]
    table: String,

    /// NBD TCP listen address
    #[arg(long, default_value = "0.0.0.0:10809")]
    nbd_listen: String,

    /// NBD export name
    #[arg(long, default_value = "dmp")]
    export_name: String,

    /// Refuse NBD writes
    #[arg(long)]
    read_only: bool,

    /// File the statistics report is published to
    #[arg(long, default_value = "/run/dmp/stat/volumes")]
    stats_path: PathBuf,

    /// Report publish interval in seconds
    #[arg(long, default_value_t = 1)]
    stats_interval_s: u64,

    /// Report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    stats_format: ReportFormat,
}

#[derive(Debug, ClapArgs)]
struct BenchArgs {
    /// Table line: <begin> <len> <target-type> [args...]
    #[arg(long, default_value = "0 131072 dmp ram0")]
    table: String,

    /// Worker threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Reads and writes issued by each thread
    #[arg(long, default_value_t = 10_000)]
    requests: u64,

    /// Request size in bytes (multiple of 512)
    #[arg(long, default_value_t = 4096)]
    block_size: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

// ── Target setup ──────────────────────────────────────────────────────────────

fn load_target(args: &Args, table: &str) -> Result<(DmpModule, DmpTarget)> {
    let module = DmpModule::load().context("load dmp module")?;

    if args.ramdisk_bytes > 0 {
        module
            .devices()
            .register("ram0", Arc::new(MemDevice::new("ram0", args.ramdisk_bytes)))
            .context("register ram0")?;
    }

    let mode: DeviceMode = args.mode.parse().context("parse --mode")?;
    let line: TableLine = table
        .parse()
        .with_context(|| format!("parse table line '{table}'"))?;
    let target = module
        .create_target(&line, mode)
        .with_context(|| format!("construct target '{line}'"))?;

    info!(
        "Target {} v{} ready: {}",
        target.target_type().name,
        target.target_type().version_string(),
        line
    );
    Ok((module, target))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match &args.command {
        Command::Serve(serve) => run_serve(&args, serve).await,
        Command::Bench(bench) => run_bench(&args, bench),
    }
}

async fn run_serve(args: &Args, serve: &ServeArgs) -> Result<()> {
    info!("Starting dmp gateway");

    let (module, target) = load_target(args, &serve.table)?;
    let target = Arc::new(target);

    // ── Statistics publisher ──────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publisher = StatsPublisher::new(
        Arc::clone(module.stats()),
        serve.stats_path.clone(),
        serve.stats_format,
    );
    let interval = Duration::from_secs(serve.stats_interval_s.max(1));
    let publish_task = tokio::spawn(publish::publish_loop(publisher, interval, shutdown_rx));

    // ── NBD listener ──────────────────────────────────────────────────────────
    let listener = TcpListener::bind(&serve.nbd_listen)
        .await
        .with_context(|| format!("bind NBD listener {}", serve.nbd_listen))?;
    info!("NBD server on {}", listener.local_addr()?);

    let read_only = serve.read_only || !target.context().mode.is_writable();
    let nbd_server = Arc::new(NbdServer::new(
        Arc::clone(&target),
        &serve.export_name,
        read_only,
    ));
    let nbd_task = tokio::spawn(NbdServer::serve(nbd_server, listener));

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("Shutting down");

    nbd_task.abort();
    let _ = shutdown_tx.send(true);
    if let Err(e) = publish_task.await {
        warn!("Publisher task failed: {e}");
    }

    // Sessions hold clones of the target until they notice the abort
    match Arc::try_unwrap(target) {
        Ok(target) => target.destroy(),
        Err(_) => warn!("Target still referenced at shutdown; leaving teardown to drop"),
    }
    module.unload();
    Ok(())
}

fn run_bench(args: &Args, bench: &BenchArgs) -> Result<()> {
    let (module, target) = load_target(args, &bench.table)?;

    let config = BenchConfig {
        threads: bench.threads,
        requests: bench.requests,
        block_size: bench.block_size,
    };
    let summary = bench::run(&target, &config)?;
    info!(
        "bench: {} ok, {} failed in {:.3}s ({:.0} IOPS)",
        summary.completed,
        summary.failed,
        summary.elapsed.as_secs_f64(),
        summary.iops()
    );

    let snapshot = module.stats().snapshot();
    if bench.json {
        println!("{}", snapshot.to_json().context("serialize report")?);
    } else {
        print!("{}", snapshot.render());
    }

    target.destroy();
    module.unload();
    Ok(())
}
