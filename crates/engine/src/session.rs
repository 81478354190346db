//! Top-level save/restore session lifecycle. Ties the suspend protocol,
//! stream writer/reader, checkpoint device harness, and save-helper
//! bridge together, and — grounded on `libxl_dom_save.c` /
//! `libxl_dom_restore.c` — guarantees the same cleanup runs whether the
//! session completed, failed partway through, or was cancelled.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use shared::Error;

use crate::devices::CheckpointDevices;
use crate::helper_bridge::{HelperAck, HelperEvent, SaveHelperBridge};
use crate::logdirty::{self, LogDirtySwitch};
use crate::stream_reader::{ReaderOutputs, StreamReader};
use crate::stream_writer::{StreamWriter, WriterInputs};
use crate::suspend::SuspendProtocol;

/// Adapts a session's toolstack-owned `WriterInputs` so `libxc_context`
/// is spliced straight through the save helper instead of coming from a
/// placeholder buffer — grounded on the handoff of the `LIBXC_CONTEXT`
/// body to the save helper's own write onto the stream in
/// `libxl_dom_save.c`.
struct HelperSplicedWriterInputs<'a> {
    helper: &'a mut SaveHelperBridge,
    inner: &'a mut dyn WriterInputs,
}

#[async_trait]
impl<'a> WriterInputs for HelperSplicedWriterInputs<'a> {
    async fn libxc_context(&mut self) -> Result<Vec<u8>, Error> {
        self.helper.recv_libxc_body().await
    }

    async fn xenstore_data(&mut self) -> Result<Vec<u8>, Error> {
        self.inner.xenstore_data().await
    }

    async fn emulator_context(&mut self) -> Result<Option<Vec<u8>>, Error> {
        self.inner.emulator_context().await
    }
}

/// Restore-side dual: hands a decoded `LIBXC_CONTEXT` payload back to the
/// helper rather than discarding it.
struct HelperSplicedReaderOutputs<'a> {
    helper: &'a mut SaveHelperBridge,
    inner: &'a mut dyn ReaderOutputs,
}

#[async_trait]
impl<'a> ReaderOutputs for HelperSplicedReaderOutputs<'a> {
    async fn on_libxc_context(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.helper.forward_libxc_body(&payload).await
    }

    async fn on_xenstore_data(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.inner.on_xenstore_data(payload).await
    }

    async fn on_emulator_context(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.inner.on_emulator_context(payload).await
    }
}

pub struct SaveSession<W> {
    suspend: SuspendProtocol,
    writer: StreamWriter<W>,
    devices: CheckpointDevices,
    helper: SaveHelperBridge,
    logdirty: Arc<dyn LogDirtySwitch>,
    domid: u32,
}

impl<W: AsyncWrite + Unpin> SaveSession<W> {
    pub fn new(
        suspend: SuspendProtocol,
        writer: StreamWriter<W>,
        devices: CheckpointDevices,
        helper: SaveHelperBridge,
        logdirty: Arc<dyn LogDirtySwitch>,
        domid: u32,
    ) -> Self {
        SaveSession {
            suspend,
            writer,
            devices,
            helper,
            logdirty,
            domid,
        }
    }

    /// Run a save session to completion, then tear down devices and the
    /// helper regardless of outcome — mirroring the always-cleanup path
    /// in `libxl__domain_save_task`.
    pub async fn run(&mut self, inputs: &mut dyn WriterInputs) -> Result<(), Error> {
        let result = self.run_inner(inputs).await;
        let teardown_result = self.teardown().await;
        result.and(teardown_result)
    }

    /// Drive the save helper's callback loop: every phase of a save is
    /// actually triggered by a `HelperEvent` the helper issues, not by us
    /// calling through the suspend/device/log-dirty collaborators on our
    /// own schedule.
    async fn run_inner(&mut self, inputs: &mut dyn WriterInputs) -> Result<(), Error> {
        self.devices.setup_all().await?;

        loop {
            match self.helper.next_event().await? {
                HelperEvent::Suspend => {
                    self.suspend.run().await?;
                    self.helper.ack(HelperAck::Ok).await?;
                }
                HelperEvent::Postcopy => {
                    self.devices.postsuspend_all().await?;
                    self.helper.ack(HelperAck::Ok).await?;
                }
                HelperEvent::SwitchLogDirty { enable } => {
                    if enable {
                        logdirty::enable_with_recovery(self.logdirty.as_ref(), self.domid).await?;
                    } else {
                        self.logdirty.disable(self.domid).await?;
                    }
                    self.helper.ack(HelperAck::Ok).await?;
                }
                HelperEvent::ToolstackSaveRestore => {
                    let mut spliced = HelperSplicedWriterInputs {
                        helper: &mut self.helper,
                        inner: inputs,
                    };
                    self.writer.run_one_pass(&mut spliced).await?;
                    self.devices.commit_all().await?;
                    self.helper.ack(HelperAck::Ok).await?;
                    break;
                }
                HelperEvent::Checkpoint => {
                    return Err(Error::invalid(
                        "unexpected CHECKPOINT callback in a non-checkpointed save session",
                    ));
                }
            }
        }

        self.helper.wait_termination().await?;
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), Error> {
        let devices_result = self.devices.teardown_all().await;
        self.helper.abort().await;
        devices_result
    }
}

pub struct RestoreSession<R> {
    reader: StreamReader<R>,
    devices: CheckpointDevices,
    helper: SaveHelperBridge,
}

impl<R: AsyncRead + Unpin> RestoreSession<R> {
    pub fn new(reader: StreamReader<R>, devices: CheckpointDevices, helper: SaveHelperBridge) -> Self {
        RestoreSession {
            reader,
            devices,
            helper,
        }
    }

    pub async fn run(&mut self, outputs: &mut dyn ReaderOutputs) -> Result<(), Error> {
        let result = self.run_inner(outputs).await;
        let teardown_result = self.teardown().await;
        result.and(teardown_result)
    }

    async fn run_inner(&mut self, outputs: &mut dyn ReaderOutputs) -> Result<(), Error> {
        self.devices.setup_all().await?;

        loop {
            match self.helper.next_event().await? {
                HelperEvent::Postcopy => {
                    self.devices.preresume_all().await?;
                    self.helper.ack(HelperAck::Ok).await?;
                }
                HelperEvent::ToolstackSaveRestore => {
                    let mut spliced = HelperSplicedReaderOutputs {
                        helper: &mut self.helper,
                        inner: outputs,
                    };
                    self.reader.run_one_pass(&mut spliced).await?;
                    self.helper.ack(HelperAck::Ok).await?;
                    break;
                }
                other => {
                    return Err(Error::invalid(format!(
                        "unexpected helper event during restore: {other:?}"
                    )));
                }
            }
        }

        self.helper.wait_termination().await?;
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), Error> {
        let devices_result = self.devices.teardown_all().await;
        self.helper.abort().await;
        devices_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    use hv_helper_sdk::config_store::InMemoryConfigStore;
    use hv_helper_sdk::hypervisor::{DomainInfo, EventChannel, HypervisorHandle};
    use hv_helper_sdk::process::{HelperTermination, SaveHelperProcess};

    use crate::devices::{CheckpointDevice, CheckpointDevices};
    use crate::suspend::{SuspendHints, SuspendProtocol};

    struct FakeHypervisor;

    #[async_trait]
    impl HypervisorHandle for FakeHypervisor {
        fn event_channel(&self, _domid: u32) -> Option<EventChannel> {
            Some(EventChannel { port: 1 })
        }

        async fn notify(&self, _channel: EventChannel) -> Result<(), hv_helper_sdk::Error> {
            Ok(())
        }

        async fn domain_info(&self, _domid: u32) -> Result<DomainInfo, hv_helper_sdk::Error> {
            Ok(DomainInfo {
                running: false,
                shutdown: true,
                shutdown_reason: Some(shared::domain::SHUTDOWN_SUSPEND),
            })
        }

        async fn domain_shutdown(&self, _domid: u32, _reason: u32) -> Result<(), hv_helper_sdk::Error> {
            Ok(())
        }

        async fn set_log_dirty(&self, _domid: u32, _enable: bool) -> Result<(), hv_helper_sdk::Error> {
            Ok(())
        }
    }

    struct NoopLogDirty;

    #[async_trait]
    impl LogDirtySwitch for NoopLogDirty {
        async fn enable(&self, _domid: u32) -> Result<(), Error> {
            Ok(())
        }
        async fn disable(&self, _domid: u32) -> Result<(), Error> {
            Ok(())
        }
    }

    struct ScriptedHelper {
        to_recv: VecDeque<Vec<u8>>,
        acks: Vec<u8>,
        libxc_sent: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl SaveHelperProcess for ScriptedHelper {
        async fn send(&mut self, msg: &[u8]) -> Result<(), hv_helper_sdk::Error> {
            if msg.len() == 1 {
                self.acks.push(msg[0]);
            } else {
                self.libxc_sent.push(msg.to_vec());
            }
            Ok(())
        }

        async fn recv(&mut self) -> Result<Vec<u8>, hv_helper_sdk::Error> {
            self.to_recv
                .pop_front()
                .ok_or(hv_helper_sdk::Error::PeerGone("scripted helper exhausted"))
        }

        async fn wait(&mut self) -> Result<HelperTermination, hv_helper_sdk::Error> {
            Ok(HelperTermination {
                rc: 0,
                retval: 0,
                errno: 0,
            })
        }

        async fn kill(&mut self) {}
    }

    struct EmptyInputs;

    #[async_trait]
    impl WriterInputs for EmptyInputs {
        async fn libxc_context(&mut self) -> Result<Vec<u8>, Error> {
            unreachable!("libxc_context must be served by the helper bridge, not the toolstack inputs")
        }
        async fn xenstore_data(&mut self) -> Result<Vec<u8>, Error> {
            Ok(vec![1])
        }
        async fn emulator_context(&mut self) -> Result<Option<Vec<u8>>, Error> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn save_session_drives_every_helper_event() {
        let hv = Arc::new(FakeHypervisor);
        let store = Arc::new(InMemoryConfigStore::new());
        let suspend = SuspendProtocol::new(
            hv.clone(),
            store,
            1,
            shared::domain::DomainType::Pv,
            SuspendHints::default(),
        );

        let mut buf = Vec::new();
        let writer = StreamWriter::new(&mut buf, false);
        let devices = CheckpointDevices::new(Vec::<Box<dyn CheckpointDevice>>::new());

        let helper = ScriptedHelper {
            to_recv: VecDeque::from(vec![
                vec![0],          // Suspend
                vec![1],          // Postcopy
                vec![3, 1],       // SwitchLogDirty { enable: true }
                vec![4],          // ToolstackSaveRestore
                vec![9, 9, 9, 9], // libxc body pulled during the writer pass
            ]),
            acks: Vec::new(),
            libxc_sent: Vec::new(),
        };
        let bridge = SaveHelperBridge::new(Box::new(helper));

        let mut session = SaveSession::new(
            suspend,
            writer,
            devices,
            bridge,
            Arc::new(NoopLogDirty),
            1,
        );

        let mut inputs = EmptyInputs;
        session.run(&mut inputs).await.unwrap();
    }

    struct FixedRecordingOutputs {
        saw_libxc: AtomicBool,
    }

    #[async_trait]
    impl ReaderOutputs for FixedRecordingOutputs {
        async fn on_libxc_context(&mut self, _payload: Vec<u8>) -> Result<(), Error> {
            self.saw_libxc.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn on_xenstore_data(&mut self, _payload: Vec<u8>) -> Result<(), Error> {
            Ok(())
        }
        async fn on_emulator_context(&mut self, _payload: Vec<u8>) -> Result<(), Error> {
            Ok(())
        }
    }

    struct EmptyInputsForWriter;

    #[async_trait]
    impl WriterInputs for EmptyInputsForWriter {
        async fn libxc_context(&mut self) -> Result<Vec<u8>, Error> {
            Ok(vec![42, 43])
        }
        async fn xenstore_data(&mut self) -> Result<Vec<u8>, Error> {
            Ok(vec![1])
        }
        async fn emulator_context(&mut self) -> Result<Option<Vec<u8>>, Error> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn restore_session_forwards_libxc_body_to_the_helper_not_the_outputs() {
        let mut stream_buf = Vec::new();
        {
            let mut writer = StreamWriter::new(&mut stream_buf, false);
            writer.run_one_pass(&mut EmptyInputsForWriter).await.unwrap();
        }

        let reader = StreamReader::new(&stream_buf[..]);
        let devices = CheckpointDevices::new(Vec::<Box<dyn CheckpointDevice>>::new());

        let helper = ScriptedHelper {
            to_recv: VecDeque::from(vec![
                vec![1], // Postcopy
                vec![4], // ToolstackSaveRestore
            ]),
            acks: Vec::new(),
            libxc_sent: Vec::new(),
        };
        let bridge = SaveHelperBridge::new(Box::new(helper));

        let mut session = RestoreSession::new(reader, devices, bridge);
        let mut outputs = FixedRecordingOutputs {
            saw_libxc: AtomicBool::new(false),
        };
        session.run(&mut outputs).await.unwrap();

        // The payload went to the helper via `forward_libxc_body`, never
        // through `ReaderOutputs::on_libxc_context`.
        assert!(!outputs.saw_libxc.load(Ordering::SeqCst));
    }
}
