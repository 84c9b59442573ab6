//! Bluetooth device discovery and bonded-device queries through BlueZ

use std::collections::HashSet;
use std::time::Duration;

use bluer::{Adapter, AdapterEvent, Address};
use futures::StreamExt;
use rfcomm_link_shared::{BondState, DeviceRecord};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::Result;

/// Configuration for Bluetooth discovery
#[derive(Debug, Clone)]
pub struct BtDiscoveryConfig {
    /// How long to scan for devices
    pub scan_duration: Duration,
}

impl Default for BtDiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(10),
        }
    }
}

/// Bluetooth device discovery service
pub struct BtDiscovery {
    config: BtDiscoveryConfig,
}

impl BtDiscovery {
    /// Create a new discovery service
    pub fn new(config: BtDiscoveryConfig) -> Self {
        Self { config }
    }

    /// Get the default Bluetooth adapter
    pub async fn get_adapter() -> Result<Adapter> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        Ok(adapter)
    }

    /// Build a record for a device known to the adapter
    pub async fn device_record(adapter: &Adapter, addr: Address) -> Option<DeviceRecord> {
        let device = adapter.device(addr).ok()?;
        let name = device.name().await.ok().flatten();
        let bond_state = match device.is_paired().await {
            Ok(true) => BondState::Bonded,
            _ => BondState::None,
        };
        Some(DeviceRecord::new(addr.to_string(), name, bond_state))
    }

    /// Snapshot of every bonded device known to the adapter
    pub async fn bonded_devices(adapter: &Adapter) -> Result<Vec<DeviceRecord>> {
        let mut bonded = Vec::new();
        for addr in adapter.device_addresses().await? {
            if let Some(record) = Self::device_record(adapter, addr).await {
                if record.bond_state == BondState::Bonded {
                    bonded.push(record);
                }
            }
        }
        Ok(bonded)
    }

    /// Scan for the configured duration, forwarding each new device
    pub async fn scan(&self, adapter: Adapter, found: mpsc::Sender<DeviceRecord>) -> Result<()> {
        let mut seen: HashSet<Address> = HashSet::new();

        // Start discovery
        let discover = adapter.discover_devices().await?;
        tokio::pin!(discover);

        let scan_result = timeout(self.config.scan_duration, async {
            while let Some(evt) = discover.next().await {
                if let AdapterEvent::DeviceAdded(addr) = evt {
                    if !seen.insert(addr) {
                        continue;
                    }

                    if let Some(record) = Self::device_record(&adapter, addr).await {
                        debug!("[BT] Found {} ({})", addr, record.display_name());
                        if found.send(record).await.is_err() {
                            // Receiver gone, nobody is interested in the rest
                            break;
                        }
                    }
                }
            }
        })
        .await;

        // Timeout is expected, not an error
        if scan_result.is_err() {
            info!("[BT] Discovery scan completed ({} devices)", seen.len());
        }

        Ok(())
    }
}
