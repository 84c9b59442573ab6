//! Link service facade
//!
//! Every command returns immediately; outcomes arrive through the listener
//! slots of the [`EventDispatcher`] and the notification broadcast.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use rfcomm_link_shared::{BondState, Command, DeviceId, DeviceRecord, LinkState, Notification};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::connection::{ConnectionManager, KeepAlive};
use crate::error::Result;
use crate::events::{
    BondListener, ConnectionListener, DiscoveryListener, EventDispatcher, ListenerCategory,
    Subscription, WriteListener,
};
use crate::registry::DeviceRegistry;
use crate::transport::{BondingStrategy, TransportProvider};

struct Inner {
    config: ServiceConfig,
    provider: Arc<dyn TransportProvider>,
    bonding: BondingStrategy,
    registry: DeviceRegistry,
    events: Arc<EventDispatcher>,
    connections: Arc<ConnectionManager>,
}

/// Discovery, bonding and connection lifecycle for one transport provider.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct LinkService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LinkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkService")
            .field("provider", &self.inner.provider.name())
            .field("bonding", &self.inner.bonding)
            .field("connected", &self.inner.connections.connected_devices())
            .finish()
    }
}

impl LinkService {
    /// Build the service, negotiating the bonding strategy once
    pub async fn new(provider: Arc<dyn TransportProvider>, config: ServiceConfig) -> Self {
        let bonding = provider.probe_bonding().await;
        info!(
            "[LINK] Using {} transport with {:?} bonding",
            provider.name(),
            bonding
        );

        let events = Arc::new(EventDispatcher::new(config.notification_capacity));
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&provider),
            Arc::clone(&events),
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                provider,
                bonding,
                registry: DeviceRegistry::new(),
                events,
                connections,
            }),
        }
    }

    pub fn bonding_strategy(&self) -> BondingStrategy {
        self.inner.bonding
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    // --- discovery and bonding ---

    /// Run one discovery scan in the background
    pub fn discover(&self) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let events = &service.inner.events;
            events.discovery_started();
            match service.inner.provider.discover().await {
                Ok(mut found) => {
                    while let Some(record) = found.next().await {
                        service.on_device_found(record);
                    }
                }
                Err(e) => warn!("[LINK] Discovery failed: {}", e),
            }
            events.discovery_finished();
        })
    }

    /// Record a discovered device; duplicates by identifier are dropped
    pub fn on_device_found(&self, record: DeviceRecord) {
        if self.inner.registry.on_device_found(record.clone()) {
            self.inner.events.device_found(&record);
        }
    }

    /// Store a bond state change and announce bonded/unbonded transitions
    pub fn on_bond_state_changed(&self, device: &DeviceId, state: BondState) {
        self.inner.registry.on_bond_state_changed(device, state);
        match state {
            BondState::Bonded => self.inner.events.bonded(device),
            BondState::None => self.inner.events.unbonded(device),
            BondState::Bonding => {}
        }
    }

    /// Bond with a device through the negotiated strategy
    pub fn pair(&self, device: DeviceId) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let inner = &service.inner;
            service.on_bond_state_changed(&device, BondState::Bonding);

            match inner.bonding {
                BondingStrategy::Modern => match inner.provider.create_bond(&device).await {
                    Ok(()) => service.on_bond_state_changed(&device, BondState::Bonded),
                    Err(e) => {
                        warn!("[LINK] Bonding with {} failed: {}", device, e);
                        service.on_bond_state_changed(&device, BondState::None);
                    }
                },
                BondingStrategy::Legacy => {
                    match inner.provider.create_bond_legacy(&device).await {
                        Ok(()) => service.on_bond_state_changed(&device, BondState::Bonded),
                        Err(e) => {
                            // Pairing simply does not proceed
                            warn!("[LINK] Legacy bonding with {} failed: {}", device, e);
                            inner.registry.on_bond_state_changed(&device, BondState::None);
                        }
                    }
                }
            }
        })
    }

    /// Remove the bond with a device
    pub fn unpair(&self, device: DeviceId) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            match service.inner.provider.remove_bond(&device).await {
                Ok(()) => service.on_bond_state_changed(&device, BondState::None),
                Err(e) => warn!("[LINK] Removing bond with {} failed: {}", device, e),
            }
        })
    }

    /// Bonded devices as reported by the transport right now
    pub async fn paired_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.inner.provider.bonded_devices().await
    }

    /// Every device seen so far, in discovery order
    pub fn discovered_devices(&self) -> Vec<DeviceRecord> {
        self.inner.registry.snapshot()
    }

    // --- connections ---

    pub fn connect(&self, device: DeviceId) -> JoinHandle<Result<()>> {
        self.inner.connections.connect(device)
    }

    pub async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        self.inner.connections.disconnect(device).await
    }

    pub async fn disconnect_detected(&self, device: &DeviceId) -> bool {
        self.inner.connections.disconnect_detected(device).await
    }

    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.inner.connections.is_connected(device)
    }

    pub fn link_state(&self, device: &DeviceId) -> LinkState {
        self.inner.connections.link_state(device)
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.inner.connections.connected_devices()
    }

    pub fn write(&self, device: &DeviceId, bytes: impl Into<Bytes>) {
        self.inner.connections.write(device, bytes.into());
    }

    pub async fn write_and_wait(&self, device: &DeviceId, bytes: &[u8]) -> Result<usize> {
        self.inner.connections.write_and_wait(device, bytes).await
    }

    /// Start the keep-alive monitor for a connected device
    pub fn monitor(&self, device: &DeviceId) -> Result<JoinHandle<()>> {
        let params = KeepAlive {
            interval: self.inner.config.keepalive_interval,
            sentinel: self.inner.config.keepalive_sentinel,
        };
        self.inner.connections.monitor(device, params)
    }

    pub fn stop_monitor(&self, device: &DeviceId) -> Result<bool> {
        self.inner.connections.stop_monitor(device)
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.connections.is_monitoring()
    }

    /// Stop all monitors, close every channel and broadcast the teardown
    pub async fn teardown(&self) {
        self.inner.connections.teardown().await;
    }

    /// Dispatch a command.
    ///
    /// Long-running commands are started in the background and report
    /// through events; only precondition failures are returned here.
    pub async fn execute(&self, command: Command) -> Result<()> {
        match command {
            Command::Discover => {
                self.discover();
            }
            Command::Pair(device) => {
                self.pair(device);
            }
            Command::Unpair(device) => {
                self.unpair(device);
            }
            Command::Connect(device) => {
                self.connect(device);
            }
            Command::Disconnect(device) => self.disconnect(&device).await?,
            Command::Write(device, bytes) => self.write(&device, bytes),
            Command::Monitor(device) => {
                self.monitor(&device)?;
            }
            Command::StopMonitor(device) => {
                self.stop_monitor(&device)?;
            }
            Command::Teardown => self.teardown().await,
        }
        Ok(())
    }

    // --- listeners ---

    pub fn set_discovery_listener(&self, listener: Arc<dyn DiscoveryListener>) -> Subscription {
        self.inner.events.set_discovery_listener(listener)
    }

    pub fn set_bond_listener(&self, listener: Arc<dyn BondListener>) -> Subscription {
        self.inner.events.set_bond_listener(listener)
    }

    pub fn set_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> Subscription {
        self.inner.events.set_connection_listener(listener)
    }

    pub fn set_write_listener(&self, listener: Arc<dyn WriteListener>) -> Subscription {
        self.inner.events.set_write_listener(listener)
    }

    pub fn unsubscribe(&self, sub: Subscription) -> bool {
        self.inner.events.unsubscribe(sub)
    }

    pub fn clear_listener(&self, category: ListenerCategory) {
        self.inner.events.clear_listener(category)
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.events.subscribe_notifications()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct BondCounter {
        bonded: AtomicUsize,
        unbonded: AtomicUsize,
    }

    impl BondListener for BondCounter {
        fn on_device_bonded(&self, _device: &DeviceId) {
            self.bonded.fetch_add(1, Ordering::SeqCst);
        }

        fn on_device_unbonded(&self, _device: &DeviceId) {
            self.unbonded.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn service(provider: &MockProvider) -> LinkService {
        LinkService::new(Arc::new(provider.clone()), ServiceConfig::default()).await
    }

    #[tokio::test]
    async fn test_discover_dedupes() {
        let provider = MockProvider::new()
            .with_device(DeviceRecord::unknown("AA:BB"))
            .with_device(DeviceRecord::unknown("AA:BB"))
            .with_device(DeviceRecord::unknown("CC:DD"));
        let service = service(&provider).await;

        service.discover().await.unwrap();
        let ids: Vec<_> = service
            .discovered_devices()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![DeviceId::from("AA:BB"), DeviceId::from("CC:DD")]);
    }

    #[tokio::test]
    async fn test_pair_modern() {
        let provider = MockProvider::new();
        let service = service(&provider).await;
        let counter = Arc::new(BondCounter::default());
        let _sub = service.set_bond_listener(counter.clone());
        let id = DeviceId::from("AA:BB");

        service.pair(id.clone()).await.unwrap();
        assert!(provider.is_bonded(&id));
        assert_eq!(counter.bonded.load(Ordering::SeqCst), 1);
        assert_eq!(service.paired_devices().await.unwrap().len(), 1);

        service.unpair(id.clone()).await.unwrap();
        assert!(!provider.is_bonded(&id));
        assert_eq!(counter.unbonded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pair_modern_failure_reverts() {
        let provider = MockProvider::new();
        let id = DeviceId::from("AA:BB");
        provider.set_bond_failure(&id, true);
        let service = service(&provider).await;
        let counter = Arc::new(BondCounter::default());
        let _sub = service.set_bond_listener(counter.clone());

        service.pair(id.clone()).await.unwrap();
        assert_eq!(counter.bonded.load(Ordering::SeqCst), 0);
        assert_eq!(counter.unbonded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pair_legacy_failure_is_silent() {
        let provider = MockProvider::new().with_bonding(BondingStrategy::Legacy);
        let id = DeviceId::from("AA:BB");
        provider.set_bond_failure(&id, true);
        let service = service(&provider).await;
        assert_eq!(service.bonding_strategy(), BondingStrategy::Legacy);

        let counter = Arc::new(BondCounter::default());
        let _sub = service.set_bond_listener(counter.clone());

        service.pair(id.clone()).await.unwrap();
        assert_eq!(provider.legacy_bond_calls(), 1);
        assert_eq!(counter.bonded.load(Ordering::SeqCst), 0);
        assert_eq!(counter.unbonded.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bond_change_for_unknown_device() {
        let provider = MockProvider::new();
        let service = service(&provider).await;
        let counter = Arc::new(BondCounter::default());
        let _sub = service.set_bond_listener(counter.clone());

        service.on_bond_state_changed(&DeviceId::from("EE:FF"), BondState::Bonded);
        assert_eq!(counter.bonded.load(Ordering::SeqCst), 1);
        assert_eq!(service.discovered_devices()[0].bond_state, BondState::Bonded);
    }

    #[tokio::test]
    async fn test_execute_monitor_without_channel() {
        let provider = MockProvider::new();
        let service = service(&provider).await;

        let result = service
            .execute(Command::Monitor(DeviceId::from("AA:BB")))
            .await;
        assert!(result.is_err());
        assert!(!service.is_monitoring());
    }
}
