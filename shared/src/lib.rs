//! rfcomm-link Shared Types
//!
//! This crate provides the device types, the per-device link state machine
//! and the control-socket codec shared between the `rfcomm-linkd` daemon,
//! the `rfcomm-linkctl` client and the test peer.

pub mod codec;
pub mod command;
pub mod event;
pub mod state_machine;

use std::fmt;

pub use command::{Command, Request};
pub use event::ServiceEvent;
pub use state_machine::{LinkEvent, LinkState, LinkStateMachine, TransitionResult};

/// Keep-alive parameters for monitored channels
pub mod keepalive {
    /// Interval between two keep-alive probes in milliseconds
    pub const PROBE_INTERVAL_MS: u64 = 10_000;

    /// Byte written to the channel as a probe
    pub const SENTINEL: u8 = 0x00;
}

/// Serial Port Profile service class UUID
pub const SPP_UUID: &str = "00001101-0000-1000-8000-00805F9B34FB";

/// Opaque radio address identifying a remote device.
///
/// Identifiers are only ever observed from the transport, never generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Bonding (pairing) state of a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BondState {
    #[default]
    None,
    Bonding,
    Bonded,
}

impl BondState {
    /// Stable name used on the control socket
    pub fn as_str(&self) -> &'static str {
        match self {
            BondState::None => "NONE",
            BondState::Bonding => "BONDING",
            BondState::Bonded => "BONDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(BondState::None),
            "BONDING" => Some(BondState::Bonding),
            "BONDED" => Some(BondState::Bonded),
            _ => None,
        }
    }
}

impl fmt::Display for BondState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A known or discovered remote device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: Option<String>,
    pub bond_state: BondState,
}

impl DeviceRecord {
    pub fn new(id: impl Into<DeviceId>, name: Option<String>, bond_state: BondState) -> Self {
        Self {
            id: id.into(),
            name,
            bond_state,
        }
    }

    /// Minimal record for a device only known by its identifier
    pub fn unknown(id: impl Into<DeviceId>) -> Self {
        Self::new(id, None, BondState::None)
    }

    /// Name for display, falling back to the identifier
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Process-wide notifications, decoupled from the listener slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A channel was installed for the device
    Connected(DeviceId),
    /// A channel was lost or closed
    Disconnected(DeviceId),
    /// Every channel was closed by a teardown
    AllConnectionsTornDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display() {
        let id = DeviceId::from("AA:BB:CC:DD:EE:FF");
        assert_eq!(id.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(id, DeviceId::new(String::from("AA:BB:CC:DD:EE:FF")));
    }

    #[test]
    fn test_bond_state_names() {
        for state in [BondState::None, BondState::Bonding, BondState::Bonded] {
            assert_eq!(BondState::parse(state.as_str()), Some(state));
        }
        assert_eq!(BondState::parse("PAIRED"), None);
    }

    #[test]
    fn test_unknown_record() {
        let record = DeviceRecord::unknown("AA:BB");
        assert_eq!(record.bond_state, BondState::None);
        assert_eq!(record.display_name(), "AA:BB");
    }
}
