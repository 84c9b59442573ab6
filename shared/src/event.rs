//! Flattened service events relayed to control clients

use crate::{DeviceId, DeviceRecord, Notification};

/// Every listener callback and notification as a single value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    DiscoveryStarted,
    DiscoveryFinished,
    DeviceFound(DeviceRecord),
    Bonded(DeviceId),
    Unbonded(DeviceId),
    ConnectionStarted(DeviceId),
    ConnectionError { device: DeviceId, reason: String },
    ConnectionEstablished(DeviceId),
    Disconnected(DeviceId),
    WriteStarted(DeviceId),
    WriteFinished { device: DeviceId, bytes: usize },
    WriteError { device: DeviceId, reason: String },
    Notification(Notification),
}

impl ServiceEvent {
    /// Wire name of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceEvent::DiscoveryStarted => "DISCOVERY_STARTED",
            ServiceEvent::DiscoveryFinished => "DISCOVERY_FINISHED",
            ServiceEvent::DeviceFound(_) => "DEVICE_FOUND",
            ServiceEvent::Bonded(_) => "BONDED",
            ServiceEvent::Unbonded(_) => "UNBONDED",
            ServiceEvent::ConnectionStarted(_) => "CONNECTION_STARTED",
            ServiceEvent::ConnectionError { .. } => "CONNECTION_ERROR",
            ServiceEvent::ConnectionEstablished(_) => "CONNECTION_ESTABLISHED",
            ServiceEvent::Disconnected(_) => "DISCONNECTED",
            ServiceEvent::WriteStarted(_) => "WRITE_STARTED",
            ServiceEvent::WriteFinished { .. } => "WRITE_FINISHED",
            ServiceEvent::WriteError { .. } => "WRITE_ERROR",
            ServiceEvent::Notification(Notification::Connected(_)) => "NOTIFY_CONNECTED",
            ServiceEvent::Notification(Notification::Disconnected(_)) => "NOTIFY_DISCONNECTED",
            ServiceEvent::Notification(Notification::AllConnectionsTornDown) => "NOTIFY_TORN_DOWN",
        }
    }

    /// Device the event is about, if any
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            ServiceEvent::DiscoveryStarted
            | ServiceEvent::DiscoveryFinished
            | ServiceEvent::Notification(Notification::AllConnectionsTornDown) => None,
            ServiceEvent::DeviceFound(record) => Some(&record.id),
            ServiceEvent::Bonded(id)
            | ServiceEvent::Unbonded(id)
            | ServiceEvent::ConnectionStarted(id)
            | ServiceEvent::ConnectionEstablished(id)
            | ServiceEvent::Disconnected(id)
            | ServiceEvent::WriteStarted(id)
            | ServiceEvent::Notification(Notification::Connected(id))
            | ServiceEvent::Notification(Notification::Disconnected(id)) => Some(id),
            ServiceEvent::ConnectionError { device, .. }
            | ServiceEvent::WriteFinished { device, .. }
            | ServiceEvent::WriteError { device, .. } => Some(device),
        }
    }

    /// Whether the event ends an operation with a failure
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ServiceEvent::ConnectionError { .. } | ServiceEvent::WriteError { .. }
        )
    }
}

impl From<Notification> for ServiceEvent {
    fn from(notification: Notification) -> Self {
        ServiceEvent::Notification(notification)
    }
}
