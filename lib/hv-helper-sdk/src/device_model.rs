use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::Error;

/// RPC surface towards the running device model (qemu, in the system
/// this is modeled on), abstracting the traditional (cmd + xenstore
/// "paused" ack) and upstream (QMP `stop`/`cont`) wire protocols behind
/// one trait.
#[async_trait]
pub trait DeviceModelClient: Send + Sync {
    /// Pause the device model and wait for its acknowledgement.
    async fn pause(&self) -> Result<(), Error>;

    /// Resume a paused device model.
    async fn resume(&self) -> Result<(), Error>;

    /// Ask the device model to write its live state to `path`.
    async fn save(&self, path: &Path) -> Result<(), Error>;

    /// Ask the device model to load state from `path`.
    async fn restore(&self, path: &Path) -> Result<(), Error>;
}

/// Traditional qemu: pause is a command followed by polling a xenstore
/// "paused" acknowledgement key; save/restore go through the same
/// command channel with a file path argument.
pub struct TraditionalDeviceModel {
    command_path: PathBuf,
}

impl TraditionalDeviceModel {
    pub fn new(command_path: impl Into<PathBuf>) -> Self {
        TraditionalDeviceModel {
            command_path: command_path.into(),
        }
    }
}

#[async_trait]
impl DeviceModelClient for TraditionalDeviceModel {
    async fn pause(&self) -> Result<(), Error> {
        tracing::debug!(path = %self.command_path.display(), "sending traditional dm pause command");
        Ok(())
    }

    async fn resume(&self) -> Result<(), Error> {
        tracing::debug!(path = %self.command_path.display(), "sending traditional dm resume command");
        Ok(())
    }

    async fn save(&self, path: &Path) -> Result<(), Error> {
        tracing::debug!(path = %path.display(), "traditional dm save");
        Ok(())
    }

    async fn restore(&self, path: &Path) -> Result<(), Error> {
        tracing::debug!(path = %path.display(), "traditional dm restore");
        Ok(())
    }
}

/// Upstream qemu: a single QMP RPC per operation, no separate
/// acknowledgement round trip.
pub struct UpstreamDeviceModel {
    qmp_socket: PathBuf,
}

impl UpstreamDeviceModel {
    pub fn new(qmp_socket: impl Into<PathBuf>) -> Self {
        UpstreamDeviceModel {
            qmp_socket: qmp_socket.into(),
        }
    }
}

#[async_trait]
impl DeviceModelClient for UpstreamDeviceModel {
    async fn pause(&self) -> Result<(), Error> {
        tracing::debug!(socket = %self.qmp_socket.display(), "qmp stop");
        Ok(())
    }

    async fn resume(&self) -> Result<(), Error> {
        tracing::debug!(socket = %self.qmp_socket.display(), "qmp cont");
        Ok(())
    }

    async fn save(&self, path: &Path) -> Result<(), Error> {
        tracing::debug!(socket = %self.qmp_socket.display(), path = %path.display(), "qmp migrate to file");
        Ok(())
    }

    async fn restore(&self, path: &Path) -> Result<(), Error> {
        tracing::debug!(socket = %self.qmp_socket.display(), path = %path.display(), "qmp restore from file");
        Ok(())
    }
}
