//! Aggregate request statistics
//!
//! One [`DmpStats`] is created per process (by [`crate::DmpModule`]) and
//! shared by every target through an `Arc`. Each counter is updated with a
//! single relaxed atomic add; there is no lock and no multi-counter
//! transaction. A reader can therefore see the per-class counters of a request
//! before its total counters (or the other way round), but once traffic stops
//! every counter is exact.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counter identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    ReadReqs = 0,
    WriteReqs = 1,
    TotalReqs = 2,
    ReadBytes = 3,
    WriteBytes = 4,
    TotalBytes = 5,
}

impl Counter {
    pub const ALL: [Counter; 6] = [
        Counter::ReadReqs,
        Counter::WriteReqs,
        Counter::TotalReqs,
        Counter::ReadBytes,
        Counter::WriteBytes,
        Counter::TotalBytes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::ReadReqs => "read_reqs",
            Counter::WriteReqs => "write_reqs",
            Counter::TotalReqs => "total_reqs",
            Counter::ReadBytes => "read_bytes",
            Counter::WriteBytes => "write_bytes",
            Counter::TotalBytes => "total_bytes",
        }
    }
}

/// Process-wide request counters
#[derive(Debug, Default)]
pub struct DmpStats {
    counters: [AtomicU64; 6],
}

impl DmpStats {
    /// Create a zeroed counter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zeroed counter set ready to be shared between targets
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Add one to `counter`
    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    /// Add `amount` to `counter`
    pub fn add(&self, counter: Counter, amount: u64) {
        self.counters[counter as usize].fetch_add(amount, Ordering::Relaxed);
    }

    /// Current value of `counter`
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// Record a read request of `bytes`
    pub fn record_read(&self, bytes: u64) {
        self.increment(Counter::ReadReqs);
        self.add(Counter::ReadBytes, bytes);
    }

    /// Record a write request of `bytes`
    pub fn record_write(&self, bytes: u64) {
        self.increment(Counter::WriteReqs);
        self.add(Counter::WriteBytes, bytes);
    }

    /// Record any request toward the totals
    pub fn record_total(&self, bytes: u64) {
        self.increment(Counter::TotalReqs);
        self.add(Counter::TotalBytes, bytes);
    }

    /// Read all six counters. Not atomic across counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_reqs: self.get(Counter::ReadReqs),
            read_bytes: self.get(Counter::ReadBytes),
            write_reqs: self.get(Counter::WriteReqs),
            write_bytes: self.get(Counter::WriteBytes),
            total_reqs: self.get(Counter::TotalReqs),
            total_bytes: self.get(Counter::TotalBytes),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub read_reqs: u64,
    pub read_bytes: u64,
    pub write_reqs: u64,
    pub write_bytes: u64,
    pub total_reqs: u64,
    pub total_bytes: u64,
}

impl StatsSnapshot {
    /// Average read size in bytes, 0 before the first read
    pub fn avg_read_size(&self) -> u64 {
        avg(self.read_bytes, self.read_reqs)
    }

    /// Average write size in bytes, 0 before the first write
    pub fn avg_write_size(&self) -> u64 {
        avg(self.write_bytes, self.write_reqs)
    }

    /// Average request size in bytes, 0 before the first request
    pub fn avg_total_size(&self) -> u64 {
        avg(self.total_bytes, self.total_reqs)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn avg(bytes: u64, reqs: u64) -> u64 {
    bytes.checked_div(reqs).unwrap_or(0)
}
