//! Remus engine: a periodic, single-sided checkpoint loop. Each iteration
//! suspends the guest, lets checkpoint devices capture their state, saves
//! a checkpoint pass over the stream, commits the devices, sleeps for the
//! configured interval, then resumes the guest and repeats. Grounded on
//! `libxl_remus.c`.
use std::time::Duration;

use tokio::io::AsyncWrite;

use shared::Error;

use crate::devices::CheckpointDevices;
use crate::stream_writer::{StreamWriter, WriterInputs};
use crate::suspend::SuspendProtocol;

pub struct RemusSession<W> {
    suspend: SuspendProtocol,
    writer: StreamWriter<W>,
    devices: CheckpointDevices,
    interval: Duration,
}

impl<W: AsyncWrite + Unpin> RemusSession<W> {
    pub fn new(
        suspend: SuspendProtocol,
        writer: StreamWriter<W>,
        devices: CheckpointDevices,
        interval: Duration,
    ) -> Self {
        RemusSession {
            suspend,
            writer,
            devices,
            interval,
        }
    }

    /// Run `iterations` checkpoint passes (an explicit bound for tests
    /// and bounded sessions; pass `None` to run until `inputs` or the
    /// caller's cancellation ends it — see `run_forever`).
    pub async fn run_n(
        &mut self,
        inputs: &mut dyn WriterInputs,
        iterations: u64,
    ) -> Result<(), Error> {
        for _ in 0..iterations {
            self.run_one_checkpoint(inputs).await?;
        }
        Ok(())
    }

    async fn run_one_checkpoint(&mut self, inputs: &mut dyn WriterInputs) -> Result<(), Error> {
        self.suspend.run().await?;
        self.devices.postsuspend_all().await?;
        self.writer.run_one_pass(inputs).await?;
        self.devices.commit_all().await?;
        tokio::time::sleep(self.interval).await;
        // Resume is driven by the hypervisor handle inside the suspend
        // protocol's next `run()` call for PV guests; HVM guests resume
        // implicitly once the device model is un-paused by `commit_all`.
        Ok(())
    }

    /// Run checkpoint passes until `inputs` errors out or the process is
    /// cancelled (e.g. the surrounding tokio task is aborted); used by the
    /// long-running CLI invocation.
    pub async fn run_forever(&mut self, inputs: &mut dyn WriterInputs) -> Result<(), Error> {
        loop {
            self.run_one_checkpoint(inputs).await?;
        }
    }

    pub async fn teardown(&mut self) -> Result<(), Error> {
        self.devices.teardown_all().await
    }
}
