#![allow(clippy::result_large_err)]
//! dmp block target
//!
//! A virtual block target that sits in front of a backing device, counts
//! every request it sees and decides what happens to it. Two target types are
//! provided:
//!
//! - **dmp**: passthrough with accounting. Reads and writes are counted and
//!   remapped onto the backing device, discards are forwarded, read-ahead and
//!   everything else is killed.
//! - **dmp-null**: null sink. No backing device; reads complete with zeroes,
//!   writes and discards are dropped.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Host I/O stack │  (NBD gateway, bench, tests)
//! └────────┬────────┘
//!          │ Bio
//! ┌────────▼────────┐
//! │    DmpTarget    │
//! │  - classify     │
//! │  - DmpStats     │  (one per process, shared by all targets)
//! │  - MappingPolicy│
//! └────────┬────────┘
//!          │ remapped Bio
//! ┌────────▼────────┐
//! │  BlockDevice    │  (MemDevice / FileDevice via DeviceRegistry)
//! └─────────────────┘
//! ```

pub mod bio;
pub mod classify;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod module;
pub mod policy;
pub mod registry;
pub mod report;
pub mod stats;
pub mod target;

pub use bio::{Bio, BioWaiter, BlkStatus, Completion, DeviceId, ReqFlags, ReqOp};
pub use classify::{ClassifiedRequest, OpKind, classify};
pub use device::{BlockDevice, DeviceMode, FileDevice, MemDevice};
pub use dispatch::MapOutcome;
pub use error::{TargetError, TargetResult};
pub use module::{DmpModule, TargetFeatures, TargetKind, TargetType, TargetTypeRegistry};
pub use policy::{Decision, MappingPolicy};
pub use registry::{DeviceHandle, DeviceRegistry};
pub use report::PrometheusExporter;
pub use stats::{Counter, DmpStats, StatsSnapshot};
pub use target::{DmpTarget, QueueLimits, StatusType, TableLine, TargetContext};

/// Sector shift (512-byte sectors)
pub const SECTOR_SHIFT: u32 = 9;

/// Sector size in bytes
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;

/// Convert a sector count to bytes
pub const fn sectors_to_bytes(sectors: u64) -> u64 {
    sectors << SECTOR_SHIFT
}

/// Convert a byte count to whole sectors (truncating)
pub const fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes >> SECTOR_SHIFT
}
