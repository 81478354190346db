//! COLO secondary-side checkpoint loop: waits for the primary's
//! `NEW_CHECKPOINT` marker, applies the incoming checkpoint pass, and
//! reports back (over the same bidirectional control pipe) the set of
//! pages it dirtied while running speculatively since the last
//! checkpoint, plus its own suspend/ready/resumed state, so the primary
//! can fold them into the next pass. Grounded on `libxl_colo_restore.c`.
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use shared::wire::{ColoContext, ColoSubId};
use shared::Error;

use crate::stream_reader::{ReaderOutputs, StreamReader};

async fn recv_marker<C: AsyncRead + Unpin>(control: &mut C) -> Result<ColoSubId, Error> {
    let mut buf = [0u8; ColoContext::WIRE_LEN];
    control.read_exact(&mut buf).await?;
    Ok(ColoContext::decode(&buf)?.id)
}

async fn send_marker<C: AsyncWrite + Unpin>(control: &mut C, id: ColoSubId) -> Result<(), Error> {
    control.write_all(&ColoContext { id }.encode()).await?;
    Ok(())
}

/// Write the dirty-pfn count/list alongside `SvmSuspended`: a `u32` count
/// followed by that many big-endian `u64` frame numbers.
async fn send_dirty_pfns<C: AsyncWrite + Unpin>(control: &mut C, pfns: &[u64]) -> Result<(), Error> {
    control.write_all(&(pfns.len() as u32).to_be_bytes()).await?;
    for pfn in pfns {
        control.write_all(&pfn.to_be_bytes()).await?;
    }
    Ok(())
}

pub struct ColoSecondarySession<R, C> {
    reader: StreamReader<R>,
    control: C,
    /// Guest frame numbers the secondary's speculative run dirtied since
    /// the last checkpoint, reported back to the primary at
    /// `SvmSuspended`.
    pub dirty_pfns: Vec<u64>,
}

impl<R, C> ColoSecondarySession<R, C>
where
    R: AsyncRead + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(reader: StreamReader<R>, control: C) -> Self {
        ColoSecondarySession {
            reader,
            control,
            dirty_pfns: Vec::new(),
        }
    }

    /// Wait for the primary to announce a checkpoint, then drive this
    /// side's half of the handshake: report suspension and the dirty-pfn
    /// list, apply the incoming stream pass, and signal ready/resumed.
    ///
    /// The secondary writes every marker but `NEW_CHECKPOINT`; it only
    /// ever reads that one from the primary.
    pub async fn run_one_checkpoint(
        &mut self,
        outputs: &mut dyn ReaderOutputs,
    ) -> Result<(), Error> {
        let marker = recv_marker(&mut self.control).await?;
        if marker != ColoSubId::NewCheckpoint {
            return Err(Error::invalid("expected NEW_CHECKPOINT marker"));
        }

        // In the full system the dirty-pfn list accumulates as the
        // colo-proxy kernel module tracks writes the secondary's
        // speculative execution makes; left empty here (§1 out of scope),
        // but still reported through the same wire path the primary reads.
        send_marker(&mut self.control, ColoSubId::SvmSuspended).await?;
        send_dirty_pfns(&mut self.control, &self.dirty_pfns).await?;
        self.dirty_pfns.clear();

        self.reader.run_one_pass(outputs).await?;

        send_marker(&mut self.control, ColoSubId::SvmReady).await?;
        send_marker(&mut self.control, ColoSubId::SvmResumed).await?;

        Ok(())
    }
}
