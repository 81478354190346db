use clap::{Parser, ValueEnum};
use shared::domain::{CheckpointDeviceKind, DomainType, EmulatorVersion, SaveFlags, SessionMode};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Save,
    Restore,
    Remus,
    ColoPrimary,
    ColoSecondary,
}

impl From<ModeArg> for SessionMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Save => SessionMode::Save,
            ModeArg::Restore => SessionMode::Restore,
            ModeArg::Remus => SessionMode::Remus,
            ModeArg::ColoPrimary => SessionMode::ColoPrimary,
            ModeArg::ColoSecondary => SessionMode::ColoSecondary,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DomainTypeArg {
    Pv,
    Hvm,
}

impl From<DomainTypeArg> for DomainType {
    fn from(d: DomainTypeArg) -> Self {
        match d {
            DomainTypeArg::Pv => DomainType::Pv,
            DomainTypeArg::Hvm => DomainType::Hvm,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum EmulatorVersionArg {
    #[default]
    Upstream,
    Traditional,
}

impl From<EmulatorVersionArg> for EmulatorVersion {
    fn from(e: EmulatorVersionArg) -> Self {
        match e {
            EmulatorVersionArg::Upstream => EmulatorVersion::Upstream,
            EmulatorVersionArg::Traditional => EmulatorVersion::Traditional,
        }
    }
}

/// `xenmigrated` — drives one save, restore, Remus, or COLO session
/// against a domain over a migration-v2 stream.
#[derive(Debug, Parser)]
#[command(name = "xenmigrated", version)]
pub struct Cli {
    /// Domain id to operate on.
    #[arg(long)]
    pub domid: u32,

    /// What kind of session to run.
    #[arg(long, value_enum)]
    pub mode: ModeArg,

    /// Guest virtualization mode.
    #[arg(long, value_enum)]
    pub domain_type: DomainTypeArg,

    /// Which device-model wire protocol to use, if a device model is
    /// attached to this domain at all.
    #[arg(long, value_enum, default_value_t = EmulatorVersionArg::Upstream)]
    pub emulator: EmulatorVersionArg,

    /// Path to read the incoming stream from (restore) or write the
    /// outgoing stream to (save).
    #[arg(long)]
    pub stream_path: PathBuf,

    /// Directory scratch files (device-model snapshots, etc) are written
    /// under.
    #[arg(long, default_value = "/var/lib/xenmigrated")]
    pub work_dir: PathBuf,

    /// Path to the external page-level save/restore helper binary.
    #[arg(long, default_value = "/usr/lib/xen/bin/xenmigrated-helper")]
    pub helper_binary: PathBuf,

    /// Path to the `xl` toolstack binary used for domain control.
    #[arg(long, default_value = "xl")]
    pub xl_binary: PathBuf,

    /// Checkpoint interval in milliseconds (Remus/COLO only).
    #[arg(long, default_value_t = 200)]
    pub interval_ms: u64,

    #[arg(long)]
    pub live: bool,

    #[arg(long)]
    pub debug: bool,

    #[arg(long)]
    pub compress: bool,

    /// Which checkpoint-device backends this session should drive.
    /// Comma-separated; an empty value means no checkpoint devices.
    #[arg(long, value_delimiter = ',', default_value = "disk")]
    pub checkpoint_devices: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub domid: u32,
    pub mode: SessionMode,
    pub domain_type: DomainType,
    pub emulator: EmulatorVersion,
    pub stream_path: PathBuf,
    pub work_dir: PathBuf,
    pub interval_ms: u64,
    pub flags: SaveFlags,
    pub checkpoint_devices: CheckpointDeviceKind,
    pub helper_binary: PathBuf,
    pub xl_binary: PathBuf,
}

impl From<Cli> for SessionConfig {
    fn from(cli: Cli) -> Self {
        let mut checkpoint_devices = CheckpointDeviceKind::NONE;
        for name in &cli.checkpoint_devices {
            match name.as_str() {
                "disk" => checkpoint_devices.insert(CheckpointDeviceKind::DISK),
                "nic" => checkpoint_devices.insert(CheckpointDeviceKind::NIC),
                "qdisk" => checkpoint_devices.insert(CheckpointDeviceKind::QDISK),
                "" => {}
                other => tracing::warn!(device = other, "ignoring unknown checkpoint device kind"),
            }
        }

        SessionConfig {
            domid: cli.domid,
            mode: cli.mode.into(),
            domain_type: cli.domain_type.into(),
            emulator: cli.emulator.into(),
            stream_path: cli.stream_path,
            work_dir: cli.work_dir,
            interval_ms: cli.interval_ms,
            flags: SaveFlags {
                live: cli.live,
                debug: cli.debug,
                checkpointed: matches!(
                    cli.mode,
                    ModeArg::Remus | ModeArg::ColoPrimary | ModeArg::ColoSecondary
                ),
                compress: cli.compress,
            },
            checkpoint_devices,
            helper_binary: cli.helper_binary,
            xl_binary: cli.xl_binary,
        }
    }
}
