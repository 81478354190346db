use async_trait::async_trait;

use crate::Error;

/// A handle to a host configuration store (xenstore, in the system this
/// is modeled on): a small hierarchical key/value tree with watches and
/// transactions. The suspend protocol's pv-control rule and the toolstack
/// physmap record both round-trip through it.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Option<String>, Error>;
    async fn write(&self, path: &str, value: &str) -> Result<(), Error>;
    async fn rm(&self, path: &str) -> Result<(), Error>;
    async fn directory(&self, path: &str) -> Result<Vec<String>, Error>;

    /// Block until `path` changes or is created, or until cancelled by the
    /// caller dropping the returned future. Used by the suspend protocol
    /// to wait on the pv-control acknowledgement key.
    async fn wait_for_change(&self, path: &str) -> Result<(), Error>;

    /// Run `body` inside a transaction; if `body` returns `Ok(Some(_))`
    /// the transaction commits, `Ok(None)` aborts it cleanly, and `Err`
    /// aborts it and propagates. Mirrors the race-safe clear-on-timeout
    /// pattern in the suspend protocol's pv-control rule.
    async fn transaction(
        &self,
        body: Box<dyn FnOnce() -> Option<()> + Send>,
    ) -> Result<bool, Error>;
}

/// An in-memory `ConfigStore` for tests: a flat map plus a broadcast
/// channel standing in for xenstore watches.
pub struct InMemoryConfigStore {
    inner: tokio::sync::Mutex<std::collections::HashMap<String, String>>,
    changed: tokio::sync::broadcast::Sender<String>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        let (changed, _) = tokio::sync::broadcast::channel(64);
        InMemoryConfigStore {
            inner: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            changed,
        }
    }
}

impl Default for InMemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn read(&self, path: &str) -> Result<Option<String>, Error> {
        Ok(self.inner.lock().await.get(path).cloned())
    }

    async fn write(&self, path: &str, value: &str) -> Result<(), Error> {
        self.inner
            .lock()
            .await
            .insert(path.to_string(), value.to_string());
        let _ = self.changed.send(path.to_string());
        Ok(())
    }

    async fn rm(&self, path: &str) -> Result<(), Error> {
        self.inner.lock().await.remove(path);
        let _ = self.changed.send(path.to_string());
        Ok(())
    }

    async fn directory(&self, path: &str) -> Result<Vec<String>, Error> {
        let prefix = format!("{path}/");
        Ok(self
            .inner
            .lock()
            .await
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|s| s.to_string())
            .collect())
    }

    async fn wait_for_change(&self, path: &str) -> Result<(), Error> {
        let mut rx = self.changed.subscribe();
        loop {
            match rx.recv().await {
                Ok(changed) if changed == path => return Ok(()),
                Ok(_) => continue,
                Err(_) => return Err(Error::PeerGone("config store watch channel closed")),
            }
        }
    }

    async fn transaction(
        &self,
        body: Box<dyn FnOnce() -> Option<()> + Send>,
    ) -> Result<bool, Error> {
        let _guard = self.inner.lock().await;
        Ok(body().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = InMemoryConfigStore::new();
        store.write("/local/domain/1/control/shutdown", "poweroff").await.unwrap();
        assert_eq!(
            store.read("/local/domain/1/control/shutdown").await.unwrap(),
            Some("poweroff".to_string())
        );
    }

    #[tokio::test]
    async fn rm_clears_value() {
        let store = InMemoryConfigStore::new();
        store.write("/k", "v").await.unwrap();
        store.rm("/k").await.unwrap();
        assert_eq!(store.read("/k").await.unwrap(), None);
    }
}
