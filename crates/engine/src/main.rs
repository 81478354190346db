mod config;
mod copier;
mod devices;
mod dm_snapshot;
mod error;
mod helper_bridge;
mod logdirty;
mod remus;
mod session;
mod stream_reader;
mod stream_writer;
mod suspend;

mod colo;

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio::fs::File;

use shared::domain::{CheckpointDeviceKind, EmulatorVersion, SessionMode};
use shared::Error;

use hv_helper_sdk::config_store::InMemoryConfigStore;
use hv_helper_sdk::hypervisor::XlCliHypervisor;
use hv_helper_sdk::process::SpawnedSaveHelper;

use crate::config::{Cli, SessionConfig};
use crate::devices::{CheckpointDevices, NullDeviceBackend};
use crate::helper_bridge::SaveHelperBridge;
use crate::logdirty::{LogDirtySwitch, Traditional, Upstream};
use crate::session::{RestoreSession, SaveSession};
use crate::stream_reader::{ReaderOutputs, StreamReader};
use crate::stream_writer::{StreamWriter, WriterInputs};
use crate::suspend::{SuspendHints, SuspendProtocol};

/// `libxc`'s own page-content stream is out of scope here (§1); the
/// external helper process writes its bytes directly onto the shared
/// stream fd rather than through this struct. These inputs only stand in
/// for the toolstack-owned XENSTORE_DATA record and an EMULATOR_CONTEXT
/// splice when one is configured.
struct ToolstackInputs {
    config_store: Arc<InMemoryConfigStore>,
    domid: u32,
}

#[async_trait]
impl WriterInputs for ToolstackInputs {
    async fn libxc_context(&mut self) -> Result<Vec<u8>, Error> {
        unreachable!(
            "the LIBXC_CONTEXT body is spliced through the save helper bridge, \
             never served by the toolstack inputs directly"
        )
    }

    async fn xenstore_data(&mut self) -> Result<Vec<u8>, Error> {
        use hv_helper_sdk::config_store::ConfigStore;
        let path = format!("/local/domain/{}", self.domid);
        let entries = self
            .config_store
            .directory(&path)
            .await
            .map_err(|e| Error::failed(e.to_string()))?;
        Ok(entries.join("\n").into_bytes())
    }

    async fn emulator_context(&mut self) -> Result<Option<Vec<u8>>, Error> {
        Ok(None)
    }
}

struct ToolstackOutputs {
    config_store: Arc<InMemoryConfigStore>,
    domid: u32,
}

#[async_trait]
impl ReaderOutputs for ToolstackOutputs {
    async fn on_libxc_context(&mut self, _payload: Vec<u8>) -> Result<(), Error> {
        unreachable!(
            "the LIBXC_CONTEXT body is forwarded to the save helper bridge before \
             a ReaderOutputs ever sees it"
        )
    }

    async fn on_xenstore_data(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        use hv_helper_sdk::config_store::ConfigStore;
        let path = format!("/local/domain/{}/restored-xenstore-data", self.domid);
        let value = String::from_utf8_lossy(&payload).into_owned();
        self.config_store
            .write(&path, &value)
            .await
            .map_err(|e| Error::failed(e.to_string()))
    }

    async fn on_emulator_context(&mut self, _payload: Vec<u8>) -> Result<(), Error> {
        Ok(())
    }
}

fn checkpoint_devices_for(kind: CheckpointDeviceKind) -> CheckpointDevices {
    let mut matched: Vec<Box<dyn devices::CheckpointDevice>> = Vec::new();
    for candidate in [
        CheckpointDeviceKind::DISK,
        CheckpointDeviceKind::NIC,
        CheckpointDeviceKind::QDISK,
    ] {
        if kind.contains(candidate) {
            matched.push(Box::new(NullDeviceBackend { kind: candidate }));
        }
    }
    CheckpointDevices::new(matched)
}

fn logdirty_switch_for(
    cfg: &SessionConfig,
    hypervisor: Arc<dyn hv_helper_sdk::hypervisor::HypervisorHandle>,
    config_store: Arc<InMemoryConfigStore>,
) -> Arc<dyn LogDirtySwitch> {
    match cfg.emulator {
        EmulatorVersion::Upstream => Arc::new(Upstream { hypervisor }),
        EmulatorVersion::Traditional => Arc::new(Traditional {
            config_store,
            dm_domid: 0,
        }),
    }
}

async fn run_save(cfg: SessionConfig) -> anyhow::Result<()> {
    let config_store = Arc::new(InMemoryConfigStore::new());
    let hypervisor = Arc::new(XlCliHypervisor::new(&cfg.xl_binary));

    let suspend = SuspendProtocol::new(
        hypervisor.clone(),
        config_store.clone(),
        cfg.domid,
        cfg.domain_type,
        SuspendHints::default(),
    );
    let logdirty = logdirty_switch_for(&cfg, hypervisor, config_store.clone());

    let file = File::create(&cfg.stream_path).await?;
    let writer = StreamWriter::new(file, cfg.flags.checkpointed);
    let devices = checkpoint_devices_for(cfg.checkpoint_devices);

    let mut helper_process = SpawnedSaveHelper::new(&cfg.helper_binary, vec![cfg.domid.to_string()]);
    helper_process.start().await?;
    let helper = SaveHelperBridge::new(Box::new(helper_process));

    let mut session = SaveSession::new(suspend, writer, devices, helper, logdirty, cfg.domid);
    let mut inputs = ToolstackInputs {
        config_store,
        domid: cfg.domid,
    };

    session.run(&mut inputs).await?;
    tracing::info!(domid = cfg.domid, "save session completed");
    Ok(())
}

async fn run_restore(cfg: SessionConfig) -> anyhow::Result<()> {
    let config_store = Arc::new(InMemoryConfigStore::new());

    let file = File::open(&cfg.stream_path).await?;
    let reader = StreamReader::new(file);
    let devices = checkpoint_devices_for(cfg.checkpoint_devices);

    let mut helper_process = SpawnedSaveHelper::new(&cfg.helper_binary, vec![cfg.domid.to_string()]);
    helper_process.start().await?;
    let helper = SaveHelperBridge::new(Box::new(helper_process));

    let mut session = RestoreSession::new(reader, devices, helper);
    let mut outputs = ToolstackOutputs {
        config_store,
        domid: cfg.domid,
    };

    session.run(&mut outputs).await?;
    tracing::info!(domid = cfg.domid, "restore session completed");
    Ok(())
}

async fn run_remus(cfg: SessionConfig) -> anyhow::Result<()> {
    let config_store = Arc::new(InMemoryConfigStore::new());
    let hypervisor = Arc::new(XlCliHypervisor::new(&cfg.xl_binary));

    let suspend = SuspendProtocol::new(
        hypervisor,
        config_store.clone(),
        cfg.domid,
        cfg.domain_type,
        SuspendHints::default(),
    );

    let file = File::create(&cfg.stream_path).await?;
    let writer = StreamWriter::new(file, true);
    let devices = checkpoint_devices_for(cfg.checkpoint_devices);

    let mut session = remus::RemusSession::new(
        suspend,
        writer,
        devices,
        std::time::Duration::from_millis(cfg.interval_ms),
    );
    let mut inputs = ToolstackInputs {
        config_store,
        domid: cfg.domid,
    };

    let result = session.run_forever(&mut inputs).await;
    session.teardown().await?;
    result.map_err(Into::into)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mode = cli.mode;
    let cfg = SessionConfig::from(cli);

    match mode {
        config::ModeArg::Save => run_save(cfg).await,
        config::ModeArg::Restore => run_restore(cfg).await,
        config::ModeArg::Remus => run_remus(cfg).await,
        config::ModeArg::ColoPrimary | config::ModeArg::ColoSecondary => {
            anyhow::bail!(
                "COLO sessions require a control-pipe endpoint not exposed over this CLI yet; \
                 drive `colo::ColoPrimarySession`/`ColoSecondarySession` directly"
            )
        }
    }
}

#[allow(dead_code)]
fn assert_session_mode_is_exhaustively_handled(mode: SessionMode) {
    match mode {
        SessionMode::Save
        | SessionMode::Restore
        | SessionMode::Remus
        | SessionMode::ColoPrimary
        | SessionMode::ColoSecondary => {}
    }
}
