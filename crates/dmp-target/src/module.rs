//! Target types and module lifecycle
//!
//! [`DmpModule`] is what a host loads once per process: it owns the shared
//! statistics, the device registry and the table of target types, and builds
//! targets from table lines.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;
use tracing::info;

use crate::device::DeviceMode;
use crate::error::{TargetError, TargetResult};
use crate::registry::DeviceRegistry;
use crate::stats::DmpStats;
use crate::target::{DmpTarget, TableLine, TargetContext};

bitflags! {
    /// Target type capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TargetFeatures: u32 {
        /// The map path never sleeps; NOWAIT bios may be sent to it
        const NOWAIT = 1 << 0;
    }
}

/// Behaviour selected by a target type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Forward to a backing device with accounting
    Passthrough,
    /// Zero reads, drop writes, no backing device
    NullSink,
}

impl TargetKind {
    /// Number of constructor arguments
    pub fn arg_count(&self) -> usize {
        match self {
            TargetKind::Passthrough => 1,
            TargetKind::NullSink => 0,
        }
    }

    /// Constructor usage string
    pub fn usage(&self) -> &'static str {
        match self {
            TargetKind::Passthrough => "<backing device path>",
            TargetKind::NullSink => "(no arguments)",
        }
    }
}

/// A registrable target type
#[derive(Debug, PartialEq, Eq)]
pub struct TargetType {
    pub name: &'static str,
    pub version: [u32; 3],
    pub features: TargetFeatures,
    pub kind: TargetKind,
}

impl TargetType {
    pub fn version_string(&self) -> String {
        let [major, minor, patch] = self.version;
        format!("{major}.{minor}.{patch}")
    }
}

/// Passthrough-with-accounting target
pub static DMP_TARGET: TargetType = TargetType {
    name: "dmp",
    version: [1, 0, 1],
    features: TargetFeatures::NOWAIT,
    kind: TargetKind::Passthrough,
};

/// Null-sink target
pub static DMP_NULL_TARGET: TargetType = TargetType {
    name: "dmp-null",
    version: [1, 0, 1],
    features: TargetFeatures::NOWAIT,
    kind: TargetKind::NullSink,
};

/// Target types by name
#[derive(Debug, Default)]
pub struct TargetTypeRegistry {
    types: RwLock<HashMap<&'static str, &'static TargetType>>,
}

impl TargetTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target_type: &'static TargetType) -> TargetResult<()> {
        let mut types = self.types.write();
        if types.contains_key(target_type.name) {
            return Err(TargetError::TargetTypeExists(target_type.name.to_string()));
        }
        types.insert(target_type.name, target_type);
        info!(
            "Registered target type {} v{}",
            target_type.name,
            target_type.version_string()
        );
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> TargetResult<()> {
        self.types
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TargetError::UnknownTargetType(name.to_string()))
    }

    pub fn lookup(&self, name: &str) -> TargetResult<&'static TargetType> {
        self.types
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| TargetError::UnknownTargetType(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.types.read().keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Process-level state shared by all targets
#[derive(Debug)]
pub struct DmpModule {
    stats: Arc<DmpStats>,
    devices: Arc<DeviceRegistry>,
    types: TargetTypeRegistry,
}

impl DmpModule {
    /// Load with a fresh device registry
    pub fn load() -> TargetResult<Self> {
        Self::load_with(DeviceRegistry::new())
    }

    /// Load on top of an existing device registry
    pub fn load_with(devices: Arc<DeviceRegistry>) -> TargetResult<Self> {
        let types = TargetTypeRegistry::new();
        types.register(&DMP_TARGET)?;
        types.register(&DMP_NULL_TARGET)?;

        info!("dmp: module loaded");
        Ok(Self {
            stats: DmpStats::shared(),
            devices,
            types,
        })
    }

    /// Build a target from a table line
    pub fn create_target(&self, line: &TableLine, mode: DeviceMode) -> TargetResult<DmpTarget> {
        let target_type = self.types.lookup(&line.target_type)?;
        DmpTarget::construct(
            target_type,
            TargetContext::from_table(line, mode),
            &line.args,
            &self.devices,
            Arc::clone(&self.stats),
        )
    }

    pub fn stats(&self) -> &Arc<DmpStats> {
        &self.stats
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn target_types(&self) -> &TargetTypeRegistry {
        &self.types
    }

    /// Text statistics report
    pub fn report(&self) -> String {
        self.stats.snapshot().render()
    }

    /// Unregister the target types. Targets still alive keep working.
    pub fn unload(self) {
        for name in self.types.names() {
            let _ = self.types.unregister(name);
        }
        info!("dmp: module unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    #[test]
    fn test_type_registry() {
        let types = TargetTypeRegistry::new();
        types.register(&DMP_TARGET).unwrap();
        assert!(matches!(
            types.register(&DMP_TARGET),
            Err(TargetError::TargetTypeExists(_))
        ));
        assert_eq!(types.lookup("dmp").unwrap().kind, TargetKind::Passthrough);
        assert!(types.lookup("linear").is_err());

        types.unregister("dmp").unwrap();
        assert!(types.lookup("dmp").is_err());
        assert!(types.unregister("dmp").is_err());
    }

    #[test]
    fn test_target_type_descriptors() {
        assert_eq!(DMP_TARGET.version_string(), "1.0.1");
        assert!(DMP_TARGET.features.contains(TargetFeatures::NOWAIT));
        assert_eq!(DMP_NULL_TARGET.kind.arg_count(), 0);
    }

    #[test]
    fn test_module_creates_targets_from_table() {
        let module = DmpModule::load().unwrap();
        assert_eq!(module.target_types().names(), vec!["dmp", "dmp-null"]);
        module
            .devices()
            .register("ram0", Arc::new(MemDevice::new("ram0", 1 << 20)))
            .unwrap();

        let line: TableLine = "0 2048 dmp ram0".parse().unwrap();
        let target = module.create_target(&line, DeviceMode::ReadWrite).unwrap();
        assert!(Arc::ptr_eq(target.stats(), module.stats()));
        assert_eq!(module.devices().open_count("ram0"), 1);

        let unknown: TableLine = "0 2048 striped ram0".parse().unwrap();
        assert!(matches!(
            module.create_target(&unknown, DeviceMode::ReadWrite),
            Err(TargetError::UnknownTargetType(_))
        ));

        target.destroy();
        assert_eq!(module.devices().open_count("ram0"), 0);
        module.unload();
    }

    #[test]
    fn test_module_report_starts_empty() {
        let module = DmpModule::load().unwrap();
        assert!(module.report().contains("total:\n\treqs: 0\n\tavg size: 0\n"));
    }
}
