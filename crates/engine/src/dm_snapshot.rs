//! Device-model snapshot: saving and restoring the emulator's own state
//! (device models keep state the hypervisor doesn't — disk geometry,
//! in-flight DMA, etc) as a signature-prefixed blob spliced into the
//! migration stream. Grounded on the `EMULATOR_CONTEXT` record plus
//! `libxl_dom_save.c`/`libxl_dom_restore.c`'s emulator-save handling.
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};

use shared::wire::{EmulatorHeader, EmulatorId};
use shared::Error;

use hv_helper_sdk::device_model::DeviceModelClient;

use crate::copier::{copy_framed_writer, copy_into_file};

/// Signature prefixing an emulator-context blob so the reader can sanity
/// check it found the splice point before handing the rest to qemu.
pub const SIGNATURE: &[u8; 8] = b"QemuDevS";

pub struct DeviceModelSnapshot {
    pub client: Arc<dyn DeviceModelClient>,
    pub emulator_id: EmulatorId,
    pub work_dir: PathBuf,
}

impl DeviceModelSnapshot {
    /// Pause isn't this module's job (the suspend protocol owns that);
    /// `save` assumes the device model is already quiesced and asks it
    /// to dump state to a scratch file, then splices that file, prefixed
    /// with an `EmulatorHeader` and an 8-byte signature and length, into
    /// the stream.
    pub async fn save<W: AsyncWrite + Unpin>(
        &self,
        domid: u32,
        index: u32,
        writer: &mut W,
    ) -> Result<(), Error> {
        let path = self.work_dir.join(format!("qemu-save.{domid}"));
        self.client.save(&path).await.map_err(|e| Error::failed(e.to_string()))?;

        let mut file = File::open(&path).await?;
        let len = file.metadata().await?.len();

        let header = EmulatorHeader {
            id: self.emulator_id,
            index,
        };
        let mut payload = Vec::with_capacity(8 + 8 + 8 + len as usize);
        payload.extend_from_slice(&header.encode());
        payload.extend_from_slice(SIGNATURE);
        payload.extend_from_slice(&len.to_be_bytes());

        // Header + signature + length go through the framed writer as one
        // record; the bulk file bytes are appended unframed immediately
        // after, then the whole thing is record-padded by the caller.
        copy_framed_writer(
            writer,
            shared::wire::RecordType::EmulatorContext,
            &payload,
        )
        .await?;
        copy_into_file(&mut file, writer).await?;

        tokio::fs::remove_file(&path).await.ok();
        Ok(())
    }

    /// Extract an emulator-context record's trailing file bytes to
    /// `<work_dir>/qemu-resume.<domid>` and hand the device model a
    /// restore RPC against that path — mirrors
    /// `XC_DEVICE_MODEL_RESTORE_FILE".%u"` in the C source, generalized
    /// to `PathBuf` rather than a fixed-size path buffer.
    pub async fn restore<R: AsyncRead + Unpin>(
        &self,
        domid: u32,
        reader: &mut R,
        body_len: u64,
    ) -> Result<(), Error> {
        let path = self.work_dir.join(format!("qemu-resume.{domid}"));
        let mut file = File::create(&path).await?;

        let mut limited = tokio::io::AsyncReadExt::take(reader, body_len);
        tokio::io::copy(&mut limited, &mut file).await?;

        self.client
            .restore(&path)
            .await
            .map_err(|e| Error::failed(e.to_string()))?;

        tokio::fs::remove_file(&path).await.ok();
        Ok(())
    }
}
