//! Known and discovered devices

use std::sync::{Mutex, MutexGuard};

use rfcomm_link_shared::{BondState, DeviceId, DeviceRecord};
use tracing::debug;

/// Discovered devices in the order they were first seen.
///
/// Records are only ever appended or updated, never removed.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    records: Mutex<Vec<DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DeviceRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a discovered record unless one with the same identifier exists.
    ///
    /// Returns true when the record was new.
    pub fn on_device_found(&self, record: DeviceRecord) -> bool {
        let mut records = self.lock();
        if records.iter().any(|r| r.id == record.id) {
            return false;
        }
        debug!("[LINK] Registered {} ({})", record.id, record.display_name());
        records.push(record);
        true
    }

    /// Store a new bond state, synthesizing a minimal record for unknown devices.
    ///
    /// Returns the updated record.
    pub fn on_bond_state_changed(&self, device: &DeviceId, state: BondState) -> DeviceRecord {
        let mut records = self.lock();
        match records.iter_mut().find(|r| &r.id == device) {
            Some(record) => {
                record.bond_state = state;
                record.clone()
            }
            None => {
                let record = DeviceRecord {
                    bond_state: state,
                    ..DeviceRecord::unknown(device.clone())
                };
                records.push(record.clone());
                record
            }
        }
    }

    pub fn get(&self, device: &DeviceId) -> Option<DeviceRecord> {
        self.lock().iter().find(|r| &r.id == device).cloned()
    }

    /// Snapshot of every known record
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_by_identifier() {
        let registry = DeviceRegistry::new();
        assert!(registry.on_device_found(DeviceRecord::new("AA:BB", Some("HC-05".into()), BondState::None)));
        // Same identifier, different name: still a duplicate
        assert!(!registry.on_device_found(DeviceRecord::new("AA:BB", Some("other".into()), BondState::Bonded)));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name.as_deref(), Some("HC-05"));
    }

    #[test]
    fn test_bond_state_update() {
        let registry = DeviceRegistry::new();
        registry.on_device_found(DeviceRecord::unknown("AA:BB"));

        let record = registry.on_bond_state_changed(&DeviceId::from("AA:BB"), BondState::Bonded);
        assert_eq!(record.bond_state, BondState::Bonded);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bond_state_for_unknown_device() {
        let registry = DeviceRegistry::new();
        let id = DeviceId::from("CC:DD");

        let record = registry.on_bond_state_changed(&id, BondState::Bonding);
        assert_eq!(record.id, id);
        assert!(record.name.is_none());
        assert_eq!(registry.get(&id).map(|r| r.bond_state), Some(BondState::Bonding));
    }
}
