//! Service and daemon configuration

use std::time::Duration;

use rfcomm_link_shared::keepalive;

use crate::transport::SimulatedDevice;

/// Tunables of the link service itself
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Sleep between two keep-alive probes
    pub keepalive_interval: Duration,
    /// Byte written as a keep-alive probe
    pub keepalive_sentinel: u8,
    /// Capacity of the notification broadcast channel
    pub notification_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_millis(keepalive::PROBE_INTERVAL_MS),
            keepalive_sentinel: keepalive::SENTINEL,
            notification_capacity: 64,
        }
    }
}

/// Bluetooth transport mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BluetoothMode {
    /// Use real RFCOMM Bluetooth (requires BlueZ and the `bluez` feature)
    Rfcomm,
    /// Use TCP simulation (for development)
    #[default]
    TcpSimulation,
}

/// Bluetooth configuration
#[derive(Debug, Clone)]
pub struct BluetoothConfig {
    /// Bluetooth transport mode
    pub mode: BluetoothMode,
    /// RFCOMM channel number
    pub channel: u8,
    /// Length of one discovery scan
    pub scan_duration: Duration,
    /// Devices served by the TCP simulation
    pub simulated_devices: Vec<SimulatedDevice>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            mode: BluetoothMode::TcpSimulation,
            channel: 1,
            scan_duration: Duration::from_secs(10),
            simulated_devices: Vec::new(),
        }
    }
}

/// Configuration for the `rfcomm-linkd` daemon
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub service: ServiceConfig,
    /// Address of the control socket
    pub control_addr: String,
    pub bluetooth: BluetoothConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            control_addr: "127.0.0.1:7878".into(),
            bluetooth: BluetoothConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.service.keepalive_interval, Duration::from_secs(10));
        assert_eq!(config.service.keepalive_sentinel, 0x00);
        assert_eq!(config.bluetooth.mode, BluetoothMode::TcpSimulation);
        assert_eq!(config.bluetooth.channel, 1);
        assert!(config.bluetooth.simulated_devices.is_empty());
    }
}
