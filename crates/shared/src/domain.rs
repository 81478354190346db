use serde::{Deserialize, Serialize};

/// The guest virtualization mode, determining which suspend-request rule
/// applies (§ Suspend Protocol) and whether a device-model snapshot is
/// taken at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainType {
    Pv,
    Hvm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmulatorVersion {
    Traditional,
    Upstream,
}

/// Flags controlling a save operation, mirroring `libxl_domain_suspend`'s
/// flag bundle: whether the guest stays running until the final pass
/// (live), whether verbose debug pages are kept, whether this save is one
/// pass of an ongoing checkpoint stream, and whether the page stream
/// should be compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SaveFlags {
    pub live: bool,
    pub debug: bool,
    pub checkpointed: bool,
    pub compress: bool,
}

/// Which checkpoint-device backends a session opts into. Absence of a
/// kind here is a deliberate configuration choice the harness honors by
/// skipping that backend's setup/teardown entirely, never a silent no-op
/// hidden inside the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointDeviceKind(pub u8);

impl CheckpointDeviceKind {
    pub const NONE: Self = CheckpointDeviceKind(0);
    pub const DISK: Self = CheckpointDeviceKind(1 << 0);
    pub const NIC: Self = CheckpointDeviceKind(1 << 1);
    pub const QDISK: Self = CheckpointDeviceKind(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for CheckpointDeviceKind {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        CheckpointDeviceKind(self.0 | rhs.0)
    }
}

/// Xen's `SHUTDOWN_suspend` reason code, passed to a domain-shutdown
/// hypercall when the suspend protocol's hypervisor-shutdown rule applies.
pub const SHUTDOWN_SUSPEND: u32 = 2;

/// The mode a session runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    Save,
    Restore,
    Remus,
    ColoPrimary,
    ColoSecondary,
}
