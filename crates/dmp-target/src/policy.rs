//! Mapping policies
//!
//! A policy is picked once, when the target is constructed, and decides the
//! fate of every classified request:
//!
//! | kind        | Passthrough                | NullSink            |
//! |-------------|----------------------------|---------------------|
//! | read        | count, forward             | zero-fill, complete |
//! | read-ahead  | kill                       | kill                |
//! | write       | count, forward             | drop, complete      |
//! | discard     | count total, forward       | drop, complete      |
//! | other       | count total, kill          | kill                |
//!
//! Only the passthrough policy touches the statistics.

use crate::classify::{ClassifiedRequest, OpKind};
use crate::registry::DeviceHandle;
use crate::stats::DmpStats;

/// What to do with one request
#[derive(Debug)]
pub enum Decision<'a> {
    /// Remap onto `dev` starting at `start` and hand it down
    Forward { dev: &'a DeviceHandle, start: u64 },
    /// Complete locally with a zero-filled payload
    ZeroFill,
    /// Complete locally without moving any data
    Drop,
    /// Fail the request
    Reject(&'static str),
}

/// Per-target mapping policy
#[derive(Debug)]
pub enum MappingPolicy {
    /// Forward to a backing device, counting traffic on the way
    Passthrough {
        dev: DeviceHandle,
        /// First sector of this target within the backing device
        start: u64,
    },
    /// No backing device
    NullSink,
}

impl MappingPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            MappingPolicy::Passthrough { .. } => "passthrough",
            MappingPolicy::NullSink => "null-sink",
        }
    }

    /// Backing device, if any
    pub fn device(&self) -> Option<&DeviceHandle> {
        match self {
            MappingPolicy::Passthrough { dev, .. } => Some(dev),
            MappingPolicy::NullSink => None,
        }
    }

    /// Update `stats` for `req`. Read-ahead reads are never counted.
    pub fn account(&self, stats: &DmpStats, req: &ClassifiedRequest) {
        if !matches!(self, MappingPolicy::Passthrough { .. }) || req.read_ahead {
            return;
        }
        match req.kind {
            OpKind::Read => stats.record_read(req.size_bytes),
            OpKind::Write => stats.record_write(req.size_bytes),
            OpKind::Discard | OpKind::Other => {}
        }
        stats.record_total(req.size_bytes);
    }

    /// Decide the fate of `req`
    pub fn decide(&self, req: &ClassifiedRequest) -> Decision<'_> {
        if req.read_ahead {
            return Decision::Reject("read-ahead");
        }
        match self {
            MappingPolicy::Passthrough { dev, start } => match req.kind {
                OpKind::Read | OpKind::Write | OpKind::Discard => Decision::Forward {
                    dev,
                    start: *start,
                },
                OpKind::Other => Decision::Reject("not handled by passthrough"),
            },
            MappingPolicy::NullSink => match req.kind {
                OpKind::Read => Decision::ZeroFill,
                OpKind::Write | OpKind::Discard => Decision::Drop,
                OpKind::Other => Decision::Reject("not handled by null sink"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceMode, MemDevice};
    use crate::registry::DeviceRegistry;
    use crate::stats::StatsSnapshot;
    use std::sync::Arc;

    fn req(kind: OpKind, size_bytes: u64, read_ahead: bool) -> ClassifiedRequest {
        ClassifiedRequest {
            kind,
            size_bytes,
            read_ahead,
        }
    }

    fn passthrough() -> (Arc<DeviceRegistry>, MappingPolicy) {
        let registry = DeviceRegistry::new();
        registry
            .register("ram0", Arc::new(MemDevice::new("ram0", 1 << 20)))
            .unwrap();
        let dev = registry.get_device("ram0", DeviceMode::ReadWrite).unwrap();
        (registry, MappingPolicy::Passthrough { dev, start: 8 })
    }

    #[test]
    fn test_passthrough_decisions() {
        let (_registry, policy) = passthrough();
        assert!(matches!(
            policy.decide(&req(OpKind::Read, 4096, false)),
            Decision::Forward { start: 8, .. }
        ));
        assert!(matches!(
            policy.decide(&req(OpKind::Discard, 4096, false)),
            Decision::Forward { .. }
        ));
        assert!(matches!(
            policy.decide(&req(OpKind::Read, 4096, true)),
            Decision::Reject(_)
        ));
        assert!(matches!(
            policy.decide(&req(OpKind::Other, 0, false)),
            Decision::Reject(_)
        ));
    }

    #[test]
    fn test_null_sink_decisions() {
        let policy = MappingPolicy::NullSink;
        assert!(policy.device().is_none());
        assert!(matches!(
            policy.decide(&req(OpKind::Read, 4096, false)),
            Decision::ZeroFill
        ));
        assert!(matches!(
            policy.decide(&req(OpKind::Write, 4096, false)),
            Decision::Drop
        ));
        assert!(matches!(
            policy.decide(&req(OpKind::Discard, 4096, false)),
            Decision::Drop
        ));
        assert!(matches!(
            policy.decide(&req(OpKind::Read, 4096, true)),
            Decision::Reject(_)
        ));
    }

    #[test]
    fn test_passthrough_accounting() {
        let (_registry, policy) = passthrough();
        let stats = DmpStats::new();

        policy.account(&stats, &req(OpKind::Read, 4096, false));
        policy.account(&stats, &req(OpKind::Write, 512, false));
        policy.account(&stats, &req(OpKind::Discard, 1 << 20, false));
        policy.account(&stats, &req(OpKind::Read, 4096, true));

        let snap = stats.snapshot();
        assert_eq!(snap.read_reqs, 1);
        assert_eq!(snap.read_bytes, 4096);
        assert_eq!(snap.write_reqs, 1);
        assert_eq!(snap.write_bytes, 512);
        assert_eq!(snap.total_reqs, 3);
        assert_eq!(snap.total_bytes, 4096 + 512 + (1 << 20));
    }

    #[test]
    fn test_null_sink_does_not_account() {
        let stats = DmpStats::new();
        let policy = MappingPolicy::NullSink;
        policy.account(&stats, &req(OpKind::Read, 4096, false));
        policy.account(&stats, &req(OpKind::Write, 4096, false));
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
