//! Listener slots and process-wide notifications.
//!
//! Each event category holds zero or one listener. Emitting with an empty
//! slot is a no-op: events are never buffered for a later listener.
//! Callbacks run on whatever task produced the event, so a listener that
//! needs a particular execution context must hop there itself.
//!
//! Registering returns a [`Subscription`]. Passing it back to
//! [`EventDispatcher::unsubscribe`] only clears the slot if that same
//! registration still occupies it, so a stale handle never removes a newer
//! listener.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rfcomm_link_shared::{DeviceId, DeviceRecord, Notification, ServiceEvent};
use tokio::sync::broadcast;

use crate::error::Error;

/// Discovery callbacks
pub trait DiscoveryListener: Send + Sync {
    fn on_discovery_started(&self) {}
    fn on_discovery_finished(&self) {}
    fn on_device_found(&self, _record: &DeviceRecord) {}
}

/// Bonding callbacks
pub trait BondListener: Send + Sync {
    fn on_device_bonded(&self, _device: &DeviceId) {}
    fn on_device_unbonded(&self, _device: &DeviceId) {}
}

/// Connection lifecycle callbacks
pub trait ConnectionListener: Send + Sync {
    fn on_connection_started(&self, _device: &DeviceId) {}
    fn on_connection_error(&self, _device: &DeviceId, _error: &Error) {}
    fn on_connection_established(&self, _device: &DeviceId) {}
    fn on_disconnected(&self, _device: &DeviceId) {}
}

/// Write outcome callbacks
pub trait WriteListener: Send + Sync {
    fn on_write_started(&self, _device: &DeviceId) {}
    fn on_write_finished(&self, _device: &DeviceId, _bytes: usize) {}
    fn on_write_error(&self, _device: &DeviceId, _error: &Error) {}
}

/// The four listener slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerCategory {
    Discovery,
    Bond,
    Connection,
    Write,
}

/// Handle returned when a listener is registered
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a Subscription leaves the listener registered; pass it to unsubscribe to remove it"]
pub struct Subscription {
    category: ListenerCategory,
    id: u64,
}

impl Subscription {
    pub fn category(&self) -> ListenerCategory {
        self.category
    }
}

struct Slot<L: ?Sized> {
    inner: Mutex<Option<(u64, Arc<L>)>>,
}

impl<L: ?Sized> Slot<L> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(u64, Arc<L>)>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, id: u64, listener: Arc<L>) {
        *self.lock() = Some((id, listener));
    }

    fn clear_if(&self, id: u64) -> bool {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some((current, _)) if *current == id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    fn clear(&self) {
        *self.lock() = None;
    }

    fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    /// Clone the listener out so callbacks run without the slot lock held
    fn get(&self) -> Option<Arc<L>> {
        self.lock().as_ref().map(|(_, listener)| Arc::clone(listener))
    }
}

/// Fan-out of listener events and broadcast notifications
pub struct EventDispatcher {
    next_id: AtomicU64,
    discovery: Slot<dyn DiscoveryListener>,
    bond: Slot<dyn BondListener>,
    connection: Slot<dyn ConnectionListener>,
    write: Slot<dyn WriteListener>,
    notifications: broadcast::Sender<Notification>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("discovery", &self.discovery.is_set())
            .field("bond", &self.bond.is_set())
            .field("connection", &self.connection.is_set())
            .field("write", &self.write.is_set())
            .field("notification_receivers", &self.notifications.receiver_count())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(notification_capacity: usize) -> Self {
        let (notifications, _) = broadcast::channel(notification_capacity.max(1));
        Self {
            next_id: AtomicU64::new(1),
            discovery: Slot::new(),
            bond: Slot::new(),
            connection: Slot::new(),
            write: Slot::new(),
            notifications,
        }
    }

    fn subscription(&self, category: ListenerCategory) -> Subscription {
        Subscription {
            category,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn set_discovery_listener(&self, listener: Arc<dyn DiscoveryListener>) -> Subscription {
        let sub = self.subscription(ListenerCategory::Discovery);
        self.discovery.set(sub.id, listener);
        sub
    }

    pub fn set_bond_listener(&self, listener: Arc<dyn BondListener>) -> Subscription {
        let sub = self.subscription(ListenerCategory::Bond);
        self.bond.set(sub.id, listener);
        sub
    }

    pub fn set_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> Subscription {
        let sub = self.subscription(ListenerCategory::Connection);
        self.connection.set(sub.id, listener);
        sub
    }

    pub fn set_write_listener(&self, listener: Arc<dyn WriteListener>) -> Subscription {
        let sub = self.subscription(ListenerCategory::Write);
        self.write.set(sub.id, listener);
        sub
    }

    /// Remove the listener registered under `sub`.
    ///
    /// Returns false when a later registration already replaced it.
    pub fn unsubscribe(&self, sub: Subscription) -> bool {
        match sub.category {
            ListenerCategory::Discovery => self.discovery.clear_if(sub.id),
            ListenerCategory::Bond => self.bond.clear_if(sub.id),
            ListenerCategory::Connection => self.connection.clear_if(sub.id),
            ListenerCategory::Write => self.write.clear_if(sub.id),
        }
    }

    /// Empty a slot regardless of who registered
    pub fn clear_listener(&self, category: ListenerCategory) {
        match category {
            ListenerCategory::Discovery => self.discovery.clear(),
            ListenerCategory::Bond => self.bond.clear(),
            ListenerCategory::Connection => self.connection.clear(),
            ListenerCategory::Write => self.write.clear(),
        }
    }

    pub fn has_listener(&self, category: ListenerCategory) -> bool {
        match category {
            ListenerCategory::Discovery => self.discovery.is_set(),
            ListenerCategory::Bond => self.bond.is_set(),
            ListenerCategory::Connection => self.connection.is_set(),
            ListenerCategory::Write => self.write.is_set(),
        }
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn notify(&self, notification: Notification) {
        // Ignore error if no receivers
        let _ = self.notifications.send(notification);
    }

    pub fn discovery_started(&self) {
        if let Some(l) = self.discovery.get() {
            l.on_discovery_started();
        }
    }

    pub fn discovery_finished(&self) {
        if let Some(l) = self.discovery.get() {
            l.on_discovery_finished();
        }
    }

    pub fn device_found(&self, record: &DeviceRecord) {
        if let Some(l) = self.discovery.get() {
            l.on_device_found(record);
        }
    }

    pub fn bonded(&self, device: &DeviceId) {
        if let Some(l) = self.bond.get() {
            l.on_device_bonded(device);
        }
    }

    pub fn unbonded(&self, device: &DeviceId) {
        if let Some(l) = self.bond.get() {
            l.on_device_unbonded(device);
        }
    }

    pub fn connection_started(&self, device: &DeviceId) {
        if let Some(l) = self.connection.get() {
            l.on_connection_started(device);
        }
    }

    pub fn connection_error(&self, device: &DeviceId, error: &Error) {
        if let Some(l) = self.connection.get() {
            l.on_connection_error(device, error);
        }
    }

    pub fn connection_established(&self, device: &DeviceId) {
        if let Some(l) = self.connection.get() {
            l.on_connection_established(device);
        }
    }

    pub fn disconnected(&self, device: &DeviceId) {
        if let Some(l) = self.connection.get() {
            l.on_disconnected(device);
        }
    }

    pub fn write_started(&self, device: &DeviceId) {
        if let Some(l) = self.write.get() {
            l.on_write_started(device);
        }
    }

    pub fn write_finished(&self, device: &DeviceId, bytes: usize) {
        if let Some(l) = self.write.get() {
            l.on_write_finished(device, bytes);
        }
    }

    pub fn write_error(&self, device: &DeviceId, error: &Error) {
        if let Some(l) = self.write.get() {
            l.on_write_error(device, error);
        }
    }
}

/// Listener for every category that flattens callbacks into [`ServiceEvent`]s
/// on a broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBridge {
    sender: broadcast::Sender<ServiceEvent>,
}

impl EventBridge {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.sender.subscribe()
    }

    pub fn send(&self, event: ServiceEvent) {
        let _ = self.sender.send(event);
    }
}

impl DiscoveryListener for EventBridge {
    fn on_discovery_started(&self) {
        self.send(ServiceEvent::DiscoveryStarted);
    }

    fn on_discovery_finished(&self) {
        self.send(ServiceEvent::DiscoveryFinished);
    }

    fn on_device_found(&self, record: &DeviceRecord) {
        self.send(ServiceEvent::DeviceFound(record.clone()));
    }
}

impl BondListener for EventBridge {
    fn on_device_bonded(&self, device: &DeviceId) {
        self.send(ServiceEvent::Bonded(device.clone()));
    }

    fn on_device_unbonded(&self, device: &DeviceId) {
        self.send(ServiceEvent::Unbonded(device.clone()));
    }
}

impl ConnectionListener for EventBridge {
    fn on_connection_started(&self, device: &DeviceId) {
        self.send(ServiceEvent::ConnectionStarted(device.clone()));
    }

    fn on_connection_error(&self, device: &DeviceId, error: &Error) {
        self.send(ServiceEvent::ConnectionError {
            device: device.clone(),
            reason: error.to_string(),
        });
    }

    fn on_connection_established(&self, device: &DeviceId) {
        self.send(ServiceEvent::ConnectionEstablished(device.clone()));
    }

    fn on_disconnected(&self, device: &DeviceId) {
        self.send(ServiceEvent::Disconnected(device.clone()));
    }
}

impl WriteListener for EventBridge {
    fn on_write_started(&self, device: &DeviceId) {
        self.send(ServiceEvent::WriteStarted(device.clone()));
    }

    fn on_write_finished(&self, device: &DeviceId, bytes: usize) {
        self.send(ServiceEvent::WriteFinished {
            device: device.clone(),
            bytes,
        });
    }

    fn on_write_error(&self, device: &DeviceId, error: &Error) {
        self.send(ServiceEvent::WriteError {
            device: device.clone(),
            reason: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        found: AtomicUsize,
    }

    impl DiscoveryListener for Counter {
        fn on_device_found(&self, _record: &DeviceRecord) {
            self.found.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_emit_without_listener_is_noop() {
        let dispatcher = EventDispatcher::new(8);
        dispatcher.device_found(&DeviceRecord::unknown("AA:BB"));

        // A listener registered afterwards does not see the earlier event
        let counter = Arc::new(Counter::default());
        let _sub = dispatcher.set_discovery_listener(counter.clone());
        assert_eq!(counter.found.load(Ordering::SeqCst), 0);

        dispatcher.device_found(&DeviceRecord::unknown("AA:BB"));
        assert_eq!(counter.found.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_last_registration_wins() {
        let dispatcher = EventDispatcher::new(8);
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());

        let first_sub = dispatcher.set_discovery_listener(first.clone());
        let second_sub = dispatcher.set_discovery_listener(second.clone());
        dispatcher.device_found(&DeviceRecord::unknown("AA:BB"));
        assert_eq!(first.found.load(Ordering::SeqCst), 0);
        assert_eq!(second.found.load(Ordering::SeqCst), 1);

        // The stale handle must not remove the newer listener
        assert!(!dispatcher.unsubscribe(first_sub));
        assert!(dispatcher.has_listener(ListenerCategory::Discovery));

        assert!(dispatcher.unsubscribe(second_sub));
        assert!(!dispatcher.has_listener(ListenerCategory::Discovery));
    }

    #[test]
    fn test_clear_listener() {
        let dispatcher = EventDispatcher::new(8);
        let _sub = dispatcher.set_discovery_listener(Arc::new(Counter::default()));
        dispatcher.clear_listener(ListenerCategory::Discovery);
        assert!(!dispatcher.has_listener(ListenerCategory::Discovery));
    }

    #[tokio::test]
    async fn test_bridge_flattens_events() {
        let dispatcher = EventDispatcher::new(8);
        let bridge = Arc::new(EventBridge::new(8));
        let mut rx = bridge.subscribe();
        let _sub = dispatcher.set_write_listener(bridge.clone());

        let id = DeviceId::from("AA:BB");
        dispatcher.write_started(&id);
        dispatcher.write_error(&id, &Error::NotConnected(id.clone()));

        assert_eq!(rx.recv().await.unwrap(), ServiceEvent::WriteStarted(id.clone()));
        assert_eq!(
            rx.recv().await.unwrap(),
            ServiceEvent::WriteError {
                device: id.clone(),
                reason: "No open channel for AA:BB".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_notifications() {
        let dispatcher = EventDispatcher::new(8);
        let mut rx = dispatcher.subscribe_notifications();
        dispatcher.notify(Notification::AllConnectionsTornDown);
        assert_eq!(rx.recv().await.unwrap(), Notification::AllConnectionsTornDown);
    }
}
