//! Checkpoint device harness: drives the optional setup/teardown/
//! postsuspend/preresume/commit phases of every checkpoint-capable device
//! backend attached to a session (disk, NIC, qdisk — see
//! `libxl_colo_qdisk.c`/`libxl_nonetbuffer.c`), in parallel, and keeps
//! exactly-one-teardown-per-matched-device bookkeeping.
use async_trait::async_trait;
use futures::future::join_all;

use shared::domain::CheckpointDeviceKind;
use shared::Error;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("{0}")]
    Failed(String),
}

impl From<DeviceError> for Error {
    fn from(e: DeviceError) -> Self {
        Error::device_mismatch(e.to_string())
    }
}

/// One checkpoint-capable device backend. Every phase defaults to a
/// no-op so a backend only needs to implement the phases it cares about
/// — mirroring the teacher's `Handler` trait shape.
#[async_trait]
pub trait CheckpointDevice: Send + Sync {
    fn kind(&self) -> CheckpointDeviceKind;

    async fn setup(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn teardown(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn postsuspend(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn preresume(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn commit(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// A device backend that implements none of the phases, used when a
/// session is explicitly configured with a checkpoint-device kind that
/// has no real backend available yet. Intentional, bring-up-only stand
/// in — never substituted silently by the harness itself.
pub struct NullDeviceBackend {
    pub kind: CheckpointDeviceKind,
}

#[async_trait]
impl CheckpointDevice for NullDeviceBackend {
    fn kind(&self) -> CheckpointDeviceKind {
        self.kind
    }
}

/// Owns the set of devices a session matched against its configured
/// `CheckpointDeviceKind` bitset, and drives their phases in parallel.
pub struct CheckpointDevices {
    matched: Vec<Box<dyn CheckpointDevice>>,
    torn_down: Vec<bool>,
}

impl CheckpointDevices {
    pub fn new(matched: Vec<Box<dyn CheckpointDevice>>) -> Self {
        let torn_down = vec![false; matched.len()];
        CheckpointDevices { matched, torn_down }
    }

    pub fn len(&self) -> usize {
        self.matched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }

    async fn run_phase<F>(&self, phase: F) -> Result<(), Error>
    where
        F: Fn(&dyn CheckpointDevice) -> futures::future::BoxFuture<'_, Result<(), DeviceError>>,
    {
        let results = join_all(self.matched.iter().map(|d| phase(d.as_ref()))).await;
        for r in results {
            r?;
        }
        Ok(())
    }

    pub async fn setup_all(&self) -> Result<(), Error> {
        self.run_phase(|d| Box::pin(d.setup())).await
    }

    pub async fn postsuspend_all(&self) -> Result<(), Error> {
        self.run_phase(|d| Box::pin(d.postsuspend())).await
    }

    pub async fn preresume_all(&self) -> Result<(), Error> {
        self.run_phase(|d| Box::pin(d.preresume())).await
    }

    pub async fn commit_all(&self) -> Result<(), Error> {
        self.run_phase(|d| Box::pin(d.commit())).await
    }

    /// Tear down every matched device exactly once. Safe to call more
    /// than once; devices already torn down are skipped.
    pub async fn teardown_all(&mut self) -> Result<(), Error> {
        let pending: Vec<usize> = self
            .torn_down
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(i, _)| i)
            .collect();

        let results = join_all(
            pending
                .iter()
                .map(|&i| self.matched[i].teardown()),
        )
        .await;

        for (&i, r) in pending.iter().zip(results) {
            self.torn_down[i] = true;
            r?;
        }
        Ok(())
    }
}
