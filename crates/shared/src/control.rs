use serde::{Deserialize, Serialize};

use crate::domain::{CheckpointDeviceKind, DomainType, SaveFlags, SessionMode};

/// A request to start a migration/checkpoint session, sent to the engine
/// over its control socket and `postcard`-encoded the way the teacher
/// encodes its vsock submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub domid: u32,
    pub mode: SessionMode,
    pub domain_type: DomainType,
    pub flags: SaveFlags,
    pub checkpoint_devices: CheckpointDeviceKind,
    /// Checkpoint interval in milliseconds, used by Remus/COLO modes.
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionResult {
    Completed,
    Failed { message: String },
    /// Emitted once per checkpoint in Remus/COLO mode; the caller decides
    /// whether to keep running.
    CheckpointTaken { sequence: u64 },
}
