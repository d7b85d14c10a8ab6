//! Target construction and teardown

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{SECTOR_SHIFT, SECTOR_SIZE};
use crate::bio::{Bio, BioWaiter};
use crate::device::DeviceMode;
use crate::error::{TargetError, TargetResult};
use crate::module::{TargetKind, TargetType};
use crate::policy::MappingPolicy;
use crate::registry::{DeviceHandle, DeviceRegistry};
use crate::stats::DmpStats;

/// One line of a device table: `<begin> <len> <target-type> [args...]`
///
/// `begin` and `len` are in 512-byte sectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLine {
    pub begin: u64,
    pub len: u64,
    pub target_type: String,
    pub args: Vec<String>,
}

impl FromStr for TableLine {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        let mut number = |what: &str| -> TargetResult<u64> {
            let field = fields.next().ok_or_else(|| {
                TargetError::InvalidConfiguration(format!("table line missing {what}"))
            })?;
            field.parse().map_err(|_| {
                TargetError::InvalidConfiguration(format!("invalid {what} '{field}'"))
            })
        };
        let begin = number("start sector")?;
        let len = number("length")?;
        let target_type = fields
            .next()
            .ok_or_else(|| TargetError::InvalidConfiguration("table line missing target type".into()))?
            .to_string();
        let args = fields.map(str::to_string).collect();

        check_geometry(begin, len)?;

        Ok(Self {
            begin,
            len,
            target_type,
            args,
        })
    }
}

impl fmt::Display for TableLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.begin, self.len, self.target_type)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Reject empty targets and ranges whose sector or byte extent overflows
fn check_geometry(begin: u64, len: u64) -> TargetResult<()> {
    if len == 0 {
        return Err(TargetError::InvalidConfiguration(
            "zero-length target".into(),
        ));
    }
    if len > u64::MAX >> SECTOR_SHIFT {
        return Err(TargetError::InvalidConfiguration(format!(
            "length {len} sectors exceeds the addressable byte range"
        )));
    }
    if begin.checked_add(len).is_none() {
        return Err(TargetError::InvalidConfiguration(format!(
            "target {begin}+{len} overflows the sector range"
        )));
    }
    Ok(())
}

/// Where a target sits in the virtual device and how its table was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetContext {
    /// First sector of the target within the virtual device
    pub begin: u64,
    /// Length in sectors
    pub len: u64,
    /// Table access mode, used for backing-device opens
    pub mode: DeviceMode,
}

impl TargetContext {
    pub fn from_table(line: &TableLine, mode: DeviceMode) -> Self {
        Self {
            begin: line.begin,
            len: line.len,
            mode,
        }
    }

    /// Size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.len.saturating_mul(SECTOR_SIZE)
    }
}

/// Queue limits a target advertises to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Largest discard the target accepts, in sectors
    pub max_discard_sectors: u32,
    /// Discard granularity in bytes
    pub discard_granularity: u32,
}

/// Status query kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    /// Runtime information
    Info,
    /// Constructor arguments
    Table,
}

/// A constructed virtual target
pub struct DmpTarget {
    target_type: &'static TargetType,
    ctx: TargetContext,
    pub(crate) policy: MappingPolicy,
    pub(crate) stats: Arc<DmpStats>,
    args: Vec<String>,
}

impl DmpTarget {
    /// Build a target of type `target_type` from its constructor arguments.
    ///
    /// Passthrough targets take exactly one argument, the backing device
    /// path, which is opened with the table's mode. Null-sink targets take
    /// none. Nothing acquired here outlives a failed construction.
    pub fn construct(
        target_type: &'static TargetType,
        ctx: TargetContext,
        args: &[String],
        devices: &Arc<DeviceRegistry>,
        stats: Arc<DmpStats>,
    ) -> TargetResult<Self> {
        info!("{}: constructing target at {}+{}", target_type.name, ctx.begin, ctx.len);
        check_geometry(ctx.begin, ctx.len)?;

        let expected = target_type.kind.arg_count();
        if args.len() != expected {
            error!(
                "{}: invalid number of arguments {}, need {expected}",
                target_type.name,
                args.len()
            );
            return Err(TargetError::InvalidConfiguration(format!(
                "usage: {} {}",
                target_type.name,
                target_type.kind.usage()
            )));
        }

        let mut owned_args = Vec::new();
        owned_args
            .try_reserve_exact(args.len())
            .map_err(|_| TargetError::OutOfMemory)?;
        owned_args.extend(args.iter().cloned());

        let policy = match target_type.kind {
            TargetKind::Passthrough => {
                let path = &args[0];
                info!("{}: backing device path: {path}", target_type.name);
                let dev = Self::acquire(devices, path, ctx.mode)?;
                MappingPolicy::Passthrough {
                    dev,
                    start: ctx.begin,
                }
            }
            TargetKind::NullSink => MappingPolicy::NullSink,
        };

        Ok(Self {
            target_type,
            ctx,
            policy,
            stats,
            args: owned_args,
        })
    }

    fn acquire(devices: &Arc<DeviceRegistry>, path: &str, mode: DeviceMode) -> TargetResult<DeviceHandle> {
        devices.get_device(path, mode).inspect_err(|e| {
            error!("device lookup failed: {e}");
        })
    }

    /// Tear the target down, releasing its backing device
    pub fn destroy(self) {
        info!(
            "{}: destroying {} target at {}+{}",
            self.target_type.name,
            self.policy.name(),
            self.ctx.begin,
            self.ctx.len
        );
        drop(self);
    }

    pub fn target_type(&self) -> &'static TargetType {
        self.target_type
    }

    pub fn context(&self) -> &TargetContext {
        &self.ctx
    }

    pub fn policy(&self) -> &MappingPolicy {
        &self.policy
    }

    /// Statistics this target reports into
    pub fn stats(&self) -> &Arc<DmpStats> {
        &self.stats
    }

    /// Backing device, absent for null-sink targets
    pub fn backing_device(&self) -> Option<&DeviceHandle> {
        self.policy.device()
    }

    /// Offset of this target's address space within the backing device, in sectors
    pub fn start_offset(&self) -> u64 {
        match &self.policy {
            MappingPolicy::Passthrough { start, .. } => *start,
            MappingPolicy::NullSink => 0,
        }
    }

    /// Flush the backing device's volatile cache.
    ///
    /// Host-side: the flush goes straight to the device and is neither
    /// classified nor counted. Null-sink targets hold no data and return
    /// `None`.
    pub fn sync_backing(&self) -> Option<BioWaiter> {
        let dev = self.policy.device()?;
        let (mut bio, waiter) = Bio::flush().with_completion();
        bio.set_dev(dev.id());
        dev.device().submit(bio);
        Some(waiter)
    }

    /// Discard limits advertised to the host
    pub fn io_hints(&self) -> QueueLimits {
        QueueLimits {
            max_discard_sectors: u32::MAX,
            discard_granularity: SECTOR_SIZE as u32,
        }
    }

    /// Status line for `kind`
    pub fn status(&self, kind: StatusType) -> String {
        match kind {
            StatusType::Info => {
                let snap = self.stats.snapshot();
                format!(
                    "{} {} {} {} {} {}",
                    snap.read_reqs,
                    snap.avg_read_size(),
                    snap.write_reqs,
                    snap.avg_write_size(),
                    snap.total_reqs,
                    snap.avg_total_size()
                )
            }
            StatusType::Table => self.args.join(" "),
        }
    }
}

impl fmt::Debug for DmpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmpTarget")
            .field("type", &self.target_type.name)
            .field("ctx", &self.ctx)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, MemDevice};
    use crate::module::{DMP_NULL_TARGET, DMP_TARGET};

    fn ctx() -> TargetContext {
        TargetContext {
            begin: 0,
            len: 2048,
            mode: DeviceMode::ReadWrite,
        }
    }

    fn registry_with_ram0() -> Arc<DeviceRegistry> {
        let registry = DeviceRegistry::new();
        registry
            .register("ram0", Arc::new(MemDevice::new("ram0", 1 << 20)))
            .unwrap();
        registry
    }

    #[test]
    fn test_table_line_parse() {
        let line: TableLine = "0 2097152 dmp /dev/loop0".parse().unwrap();
        assert_eq!(line.begin, 0);
        assert_eq!(line.len, 2097152);
        assert_eq!(line.target_type, "dmp");
        assert_eq!(line.args, vec!["/dev/loop0".to_string()]);
        assert_eq!(line.to_string(), "0 2097152 dmp /dev/loop0");

        let null: TableLine = "8 100 dmp-null".parse().unwrap();
        assert!(null.args.is_empty());
    }

    #[test]
    fn test_table_line_errors() {
        assert!("".parse::<TableLine>().is_err());
        assert!("x 10 dmp".parse::<TableLine>().is_err());
        assert!("0 10".parse::<TableLine>().is_err());
        assert!("0 0 dmp /dev/sda".parse::<TableLine>().is_err());
    }

    #[test]
    fn test_table_line_geometry_overflow() {
        let max = u64::MAX;
        assert!(format!("0 {max} dmp-null").parse::<TableLine>().is_err());
        assert!(format!("0 {} dmp-null", (max >> 9) + 1).parse::<TableLine>().is_err());
        assert!(format!("{} 2 dmp-null", max - 1).parse::<TableLine>().is_err());

        let line: TableLine = format!("0 {} dmp-null", max >> 9).parse().unwrap();
        assert_eq!(line.len, max >> 9);
        let line: TableLine = format!("{} 1 dmp-null", max - 1).parse().unwrap();
        assert_eq!(line.begin, max - 1);
    }

    #[test]
    fn test_construct_rejects_oversized_context() {
        let registry = DeviceRegistry::new();
        let huge = TargetContext {
            len: u64::MAX,
            ..ctx()
        };
        assert_eq!(huge.size_bytes(), u64::MAX);
        let result = DmpTarget::construct(&DMP_NULL_TARGET, huge, &[], &registry, DmpStats::shared());
        assert!(matches!(result, Err(TargetError::InvalidConfiguration(_))));

        let wrapping = TargetContext {
            begin: u64::MAX - 10,
            len: 2048,
            ..ctx()
        };
        let result =
            DmpTarget::construct(&DMP_NULL_TARGET, wrapping, &[], &registry, DmpStats::shared());
        assert!(matches!(result, Err(TargetError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_sync_backing_reaches_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 8192]).unwrap();
        file.flush().unwrap();
        let path = file.path().to_string_lossy().to_string();

        let registry = DeviceRegistry::new();
        let stats = DmpStats::shared();
        let ctx = TargetContext { len: 16, ..ctx() };
        let target =
            DmpTarget::construct(&DMP_TARGET, ctx, &[path], &registry, Arc::clone(&stats)).unwrap();

        let waiter = target.sync_backing().unwrap();
        assert!(waiter.wait().status.is_ok());
        assert_eq!(target.backing_device().unwrap().device().submitted(), 1);
        assert_eq!(stats.snapshot(), crate::stats::StatsSnapshot::default());

        let null =
            DmpTarget::construct(&DMP_NULL_TARGET, ctx, &[], &registry, DmpStats::shared()).unwrap();
        assert!(null.sync_backing().is_none());
    }

    #[test]
    fn test_construct_passthrough() {
        let registry = registry_with_ram0();
        let ctx = TargetContext { begin: 16, ..ctx() };
        let target = DmpTarget::construct(
            &DMP_TARGET,
            ctx,
            &["ram0".to_string()],
            &registry,
            DmpStats::shared(),
        )
        .unwrap();

        assert_eq!(target.start_offset(), 16);
        assert_eq!(target.backing_device().unwrap().path(), "ram0");
        assert_eq!(target.status(StatusType::Table), "ram0");
        assert_eq!(registry.open_count("ram0"), 1);
    }

    #[test]
    fn test_construct_without_arguments() {
        let registry = registry_with_ram0();
        let result = DmpTarget::construct(&DMP_TARGET, ctx(), &[], &registry, DmpStats::shared());
        assert!(matches!(result, Err(TargetError::InvalidConfiguration(_))));
        assert_eq!(registry.open_count("ram0"), 0);
    }

    #[test]
    fn test_construct_too_many_arguments() {
        let registry = registry_with_ram0();
        let args = vec!["ram0".to_string(), "extra".to_string()];
        let result = DmpTarget::construct(&DMP_TARGET, ctx(), &args, &registry, DmpStats::shared());
        assert!(matches!(result, Err(TargetError::InvalidConfiguration(_))));
        assert_eq!(registry.open_count("ram0"), 0);
    }

    #[test]
    fn test_construct_missing_device() {
        let registry = registry_with_ram0();
        let result = DmpTarget::construct(
            &DMP_TARGET,
            ctx(),
            &["/nonexistent/backing".to_string()],
            &registry,
            DmpStats::shared(),
        );
        assert!(matches!(result, Err(TargetError::DeviceLookupFailed { .. })));
        assert!(!registry.contains("/nonexistent/backing"));
    }

    #[test]
    fn test_construct_null_sink() {
        let registry = DeviceRegistry::new();
        let target =
            DmpTarget::construct(&DMP_NULL_TARGET, ctx(), &[], &registry, DmpStats::shared()).unwrap();
        assert!(target.backing_device().is_none());
        assert_eq!(target.status(StatusType::Table), "");

        let result = DmpTarget::construct(
            &DMP_NULL_TARGET,
            ctx(),
            &["ram0".to_string()],
            &registry,
            DmpStats::shared(),
        );
        assert!(matches!(result, Err(TargetError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_destroy_releases_device_once() {
        let registry = registry_with_ram0();
        let first = DmpTarget::construct(
            &DMP_TARGET,
            ctx(),
            &["ram0".to_string()],
            &registry,
            DmpStats::shared(),
        )
        .unwrap();
        let second = DmpTarget::construct(
            &DMP_TARGET,
            ctx(),
            &["ram0".to_string()],
            &registry,
            DmpStats::shared(),
        )
        .unwrap();
        assert_eq!(registry.open_count("ram0"), 2);

        first.destroy();
        assert_eq!(registry.open_count("ram0"), 1);
        second.destroy();
        assert_eq!(registry.open_count("ram0"), 0);
    }

    #[test]
    fn test_io_hints() {
        let registry = DeviceRegistry::new();
        let target =
            DmpTarget::construct(&DMP_NULL_TARGET, ctx(), &[], &registry, DmpStats::shared()).unwrap();
        let limits = target.io_hints();
        assert_eq!(limits.max_discard_sectors, u32::MAX);
        assert_eq!(limits.discard_granularity, 512);
    }

    #[test]
    fn test_status_info_reflects_stats() {
        let registry = registry_with_ram0();
        let stats = DmpStats::shared();
        let target = DmpTarget::construct(
            &DMP_TARGET,
            ctx(),
            &["ram0".to_string()],
            &registry,
            Arc::clone(&stats),
        )
        .unwrap();
        stats.record_read(4096);
        stats.record_total(4096);
        assert_eq!(target.status(StatusType::Info), "1 4096 0 0 1 4096");
    }
}
