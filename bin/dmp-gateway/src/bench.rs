//! Local traffic generator
//!
//! Each worker thread issues `requests` writes and `requests` reads of
//! `block_size` bytes, interleaved, walking the target's address space. Every
//! bio is waited on before the next one is issued.

use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, bail, ensure};
use dmp_target::{Bio, DmpTarget, SECTOR_SIZE, bytes_to_sectors};

#[derive(Debug, Clone, Copy)]
pub struct BenchConfig {
    pub threads: usize,
    pub requests: u64,
    pub block_size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BenchSummary {
    pub completed: u64,
    pub failed: u64,
    pub elapsed: Duration,
}

impl BenchSummary {
    pub fn iops(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.completed + self.failed) as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Default)]
struct WorkerCounts {
    completed: u64,
    failed: u64,
}

pub fn run(target: &DmpTarget, config: &BenchConfig) -> Result<BenchSummary> {
    ensure!(config.threads > 0, "need at least one thread");
    ensure!(
        config.block_size > 0 && config.block_size % SECTOR_SIZE == 0,
        "block size {} is not a multiple of {SECTOR_SIZE}",
        config.block_size
    );
    let blocks = target.context().size_bytes() / config.block_size;
    ensure!(
        blocks > 0,
        "block size {} exceeds target size {}",
        config.block_size,
        target.context().size_bytes()
    );

    let started = Instant::now();
    let counts = thread::scope(|scope| {
        let workers: Vec<_> = (0..config.threads)
            .map(|t| scope.spawn(move || worker(target, config, blocks, t as u64)))
            .collect();
        join_workers(workers)
    })?;

    Ok(BenchSummary {
        completed: counts.iter().map(|c| c.completed).sum(),
        failed: counts.iter().map(|c| c.failed).sum(),
        elapsed: started.elapsed(),
    })
}

/// Join every worker; a panicked worker fails the whole run
fn join_workers(workers: Vec<ScopedJoinHandle<'_, WorkerCounts>>) -> Result<Vec<WorkerCounts>> {
    let mut counts = Vec::with_capacity(workers.len());
    let mut panicked = 0usize;
    for worker in workers {
        match worker.join() {
            Ok(c) => counts.push(c),
            Err(_) => panicked += 1,
        }
    }
    if panicked > 0 {
        bail!("{panicked} bench worker(s) panicked");
    }
    Ok(counts)
}

fn worker(target: &DmpTarget, config: &BenchConfig, blocks: u64, id: u64) -> WorkerCounts {
    let mut counts = WorkerCounts::default();
    let payload = vec![id as u8; config.block_size as usize];
    let mut tally = |ok: bool| {
        if ok {
            counts.completed += 1;
        } else {
            counts.failed += 1;
        }
    };

    for i in 0..config.requests {
        let block = (id * config.requests + i) % blocks;
        let sector = bytes_to_sectors(block * config.block_size);

        let (bio, waiter) = Bio::write(sector, &payload).with_completion();
        target.map(bio);
        tally(waiter.wait().status.is_ok());

        let (bio, waiter) = Bio::read(sector, config.block_size).with_completion();
        target.map(bio);
        tally(waiter.wait().status.is_ok());
    }
    counts
}
