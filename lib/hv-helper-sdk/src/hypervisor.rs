use async_trait::async_trait;

use crate::Error;

/// An event channel port bound to a domain's suspend-request callback.
/// `Option<EventChannel>` models whether the channel is initialized,
/// standing in for the C source's `guest_evtchn.port >= 0` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventChannel {
    pub port: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    pub running: bool,
    pub shutdown: bool,
    pub shutdown_reason: Option<u32>,
}

/// The hypervisor control surface a suspend/checkpoint session drives
/// directly: requesting a guest suspend, toggling log-dirty mode, and
/// polling domain state. Modeled as a trait so the suspend protocol and
/// log-dirty switch can be tested without a real hypervisor underneath.
#[async_trait]
pub trait HypervisorHandle: Send + Sync {
    fn event_channel(&self, domid: u32) -> Option<EventChannel>;

    async fn notify(&self, channel: EventChannel) -> Result<(), Error>;

    async fn domain_info(&self, domid: u32) -> Result<DomainInfo, Error>;

    async fn domain_shutdown(&self, domid: u32, reason: u32) -> Result<(), Error>;

    /// Single-RPC (upstream) dirty-log enable/disable.
    async fn set_log_dirty(&self, domid: u32, enable: bool) -> Result<(), Error>;
}

/// A `HypervisorHandle` that shells out to the `xl` toolstack CLI rather
/// than issuing hypercalls directly — the actual hypercall surface is out
/// of scope here; this is the same boundary the C source draws between
/// `libxl` (talks to the kernel) and its own callers.
pub struct XlCliHypervisor {
    pub xl_binary: std::path::PathBuf,
    pub event_channels: std::collections::HashMap<u32, EventChannel>,
}

impl XlCliHypervisor {
    pub fn new(xl_binary: impl Into<std::path::PathBuf>) -> Self {
        XlCliHypervisor {
            xl_binary: xl_binary.into(),
            event_channels: std::collections::HashMap::new(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, Error> {
        tokio::process::Command::new(&self.xl_binary)
            .args(args)
            .output()
            .await
            .map_err(Error::Process)
    }
}

#[async_trait]
impl HypervisorHandle for XlCliHypervisor {
    fn event_channel(&self, domid: u32) -> Option<EventChannel> {
        self.event_channels.get(&domid).copied()
    }

    async fn notify(&self, _channel: EventChannel) -> Result<(), Error> {
        Err(Error::InvalidState(
            "event-channel notify requires direct hypercall access, not modeled here",
        ))
    }

    async fn domain_info(&self, domid: u32) -> Result<DomainInfo, Error> {
        let output = self.run(&["domstate", &domid.to_string()]).await?;
        let state = String::from_utf8_lossy(&output.stdout);
        let state = state.trim();
        Ok(DomainInfo {
            running: state == "running" || state == "blocked",
            shutdown: state == "shutdown" || state == "dying",
            shutdown_reason: None,
        })
    }

    async fn domain_shutdown(&self, domid: u32, _reason: u32) -> Result<(), Error> {
        self.run(&["shutdown", &domid.to_string()]).await?;
        Ok(())
    }

    async fn set_log_dirty(&self, domid: u32, enable: bool) -> Result<(), Error> {
        let verb = if enable { "enable" } else { "disable" };
        self.run(&["logdirty", &domid.to_string(), verb]).await?;
        Ok(())
    }
}
