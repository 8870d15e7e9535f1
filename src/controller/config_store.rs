//! Shared handle to the singleton operator configuration.
//!
//! Every controller blocks its first sync on [`ConfigStore::initial_config`]
//! and thereafter reads copy-out snapshots, so a reconcile always works
//! against one coherent config rather than a value that can change under it.

use tokio::sync::watch;

use crate::crd::ConfigSpec;

#[derive(Clone)]
pub struct ConfigStore {
    tx: watch::Sender<Option<ConfigSpec>>,
    rx: watch::Receiver<Option<ConfigSpec>>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { tx, rx }
    }

    /// Record the latest observed config.
    pub fn set(&self, config: ConfigSpec) {
        // send only fails with no receivers; we always hold one.
        let _ = self.tx.send(Some(config));
    }

    /// Snapshot of the current config, if one has been observed.
    pub fn snapshot(&self) -> Option<ConfigSpec> {
        self.rx.borrow().clone()
    }

    /// Wait until a config has been observed and return it. Used as the
    /// one-time startup barrier; after it resolves, `snapshot` never
    /// returns `None`.
    pub async fn initial_config(&self) -> ConfigSpec {
        let mut rx = self.rx.clone();
        loop {
            if let Some(config) = rx.borrow_and_update().clone() {
                return config;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as the store; unreachable in practice.
                unreachable!("config store sender dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CloudProviderConfig, LocalCloudProviderConfig, ServiceMeshConfig};

    fn config() -> ConfigSpec {
        ConfigSpec {
            cloud_provider: CloudProviderConfig::Local(LocalCloudProviderConfig::default()),
            service_mesh: ServiceMeshConfig::Envoy(Default::default()),
            dns_flush_interval_secs: 5,
            component_builder: Default::default(),
        }
    }

    #[tokio::test]
    async fn snapshot_is_none_before_first_set() {
        let store = ConfigStore::new();
        assert!(store.snapshot().is_none());
    }

    #[tokio::test]
    async fn initial_config_resolves_once_set() {
        let store = ConfigStore::new();
        let waiter = store.clone();
        let handle = tokio::spawn(async move { waiter.initial_config().await });

        store.set(config());
        let got = handle.await.unwrap();
        assert_eq!(got.dns_flush_interval_secs, 5);
        assert!(store.snapshot().is_some());
    }

    #[tokio::test]
    async fn set_replaces_snapshot() {
        let store = ConfigStore::new();
        store.set(config());
        let mut updated = config();
        updated.dns_flush_interval_secs = 30;
        store.set(updated);
        assert_eq!(store.snapshot().unwrap().dns_flush_interval_secs, 30);
    }
}
