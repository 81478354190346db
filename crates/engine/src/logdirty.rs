//! Log-dirty switch: toggling the hypervisor's dirty-page tracking for a
//! domain, with the traditional (xenstore request/reply key pair) and
//! upstream (single RPC) protocols behind one trait, and the
//! enable-failure recovery path (disable then retry enable) from
//! `libxl_dom_save.c`.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared::Error;

use hv_helper_sdk::config_store::ConfigStore;
use hv_helper_sdk::hypervisor::HypervisorHandle;

const LOG_DIRTY_DEADLINE: Duration = Duration::from_secs(10);

#[async_trait]
pub trait LogDirtySwitch: Send + Sync {
    async fn enable(&self, domid: u32) -> Result<(), Error>;
    async fn disable(&self, domid: u32) -> Result<(), Error>;
}

/// Upstream: a single hypercall-backed RPC per direction.
pub struct Upstream {
    pub hypervisor: Arc<dyn HypervisorHandle>,
}

#[async_trait]
impl LogDirtySwitch for Upstream {
    async fn enable(&self, domid: u32) -> Result<(), Error> {
        tokio::time::timeout(LOG_DIRTY_DEADLINE, self.hypervisor.set_log_dirty(domid, true))
            .await
            .map_err(|_| Error::timed_out("upstream log-dirty enable"))?
            .map_err(|e| Error::failed(e.to_string()))
    }

    async fn disable(&self, domid: u32) -> Result<(), Error> {
        tokio::time::timeout(LOG_DIRTY_DEADLINE, self.hypervisor.set_log_dirty(domid, false))
            .await
            .map_err(|_| Error::timed_out("upstream log-dirty disable"))?
            .map_err(|e| Error::failed(e.to_string()))
    }
}

/// Traditional qemu: the toolstack writes a request key, then waits for
/// the device model to write back an acknowledgement key.
pub struct Traditional {
    pub config_store: Arc<dyn ConfigStore>,
    pub dm_domid: u32,
}

impl Traditional {
    fn request_path(&self, domid: u32) -> String {
        format!("/local/domain/{}/device-model/{}/logdirty/cmd", self.dm_domid, domid)
    }

    fn ack_path(&self, domid: u32) -> String {
        format!("/local/domain/{}/device-model/{}/logdirty/ret", self.dm_domid, domid)
    }

    async fn request(&self, domid: u32, cmd: &str) -> Result<(), Error> {
        let request_path = self.request_path(domid);
        let ack_path = self.ack_path(domid);
        self.config_store
            .write(&request_path, cmd)
            .await
            .map_err(|e| Error::failed(e.to_string()))?;

        tokio::time::timeout(LOG_DIRTY_DEADLINE, self.config_store.wait_for_change(&ack_path))
            .await
            .map_err(|_| Error::timed_out("traditional log-dirty ack"))?
            .map_err(|e| Error::failed(e.to_string()))?;

        let ack = self
            .config_store
            .read(&ack_path)
            .await
            .map_err(|e| Error::failed(e.to_string()))?;
        match ack.as_deref() {
            Some(v) if v == cmd => Ok(()),
            _ => Err(Error::failed("device model returned a logdirty nack")),
        }
    }
}

#[async_trait]
impl LogDirtySwitch for Traditional {
    async fn enable(&self, domid: u32) -> Result<(), Error> {
        self.request(domid, "enable").await
    }

    async fn disable(&self, domid: u32) -> Result<(), Error> {
        self.request(domid, "disable").await
    }
}

/// Enable dirty-log tracking, retrying once via disable-then-enable if
/// the first attempt fails — the device model may have been left in an
/// inconsistent state by a previous, aborted session.
pub async fn enable_with_recovery(
    switch: &dyn LogDirtySwitch,
    domid: u32,
) -> Result<(), Error> {
    match switch.enable(domid).await {
        Ok(()) => Ok(()),
        Err(first_err) => {
            tracing::warn!(error = %first_err, "log-dirty enable failed, retrying via disable+enable");
            switch.disable(domid).await?;
            switch.enable(domid).await.map_err(|_| first_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hv_helper_sdk::config_store::InMemoryConfigStore;
    use hv_helper_sdk::hypervisor::{DomainInfo, EventChannel};

    struct FlakyHypervisor {
        fail_first: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl HypervisorHandle for FlakyHypervisor {
        fn event_channel(&self, _domid: u32) -> Option<EventChannel> {
            None
        }

        async fn notify(&self, _channel: EventChannel) -> Result<(), hv_helper_sdk::Error> {
            Ok(())
        }

        async fn domain_info(&self, _domid: u32) -> Result<DomainInfo, hv_helper_sdk::Error> {
            Ok(DomainInfo {
                running: true,
                shutdown: false,
                shutdown_reason: None,
            })
        }

        async fn domain_shutdown(&self, _domid: u32, _reason: u32) -> Result<(), hv_helper_sdk::Error> {
            Ok(())
        }

        async fn set_log_dirty(&self, _domid: u32, enable: bool) -> Result<(), hv_helper_sdk::Error> {
            if enable && self.fail_first.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(hv_helper_sdk::Error::DeviceModel("not ready yet".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn traditional_round_trips_through_store() {
        let store = Arc::new(InMemoryConfigStore::new());
        let switch = Traditional {
            config_store: store.clone(),
            dm_domid: 0,
        };

        let ack_path = switch.ack_path(5);
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            writer.write(&ack_path, "enable").await.unwrap();
        });

        switch.enable(5).await.unwrap();
    }

    #[tokio::test]
    async fn upstream_recovers_from_first_failure() {
        let hv = Arc::new(FlakyHypervisor {
            fail_first: std::sync::atomic::AtomicBool::new(true),
        });
        let switch = Upstream { hypervisor: hv };
        enable_with_recovery(&switch, 5).await.unwrap();
    }
}
