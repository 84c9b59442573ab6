//! Radio transports consumed by the link service
//!
//! - `tcp`: TCP endpoints standing in for devices (development, always built)
//! - `bluetooth`: BlueZ adapter with RFCOMM channels (`bluez` feature)

#[cfg(feature = "bluez")]
pub mod bluetooth;
#[cfg(feature = "bluez")]
pub mod bt_discovery;
#[cfg(feature = "bluez")]
pub mod rfcomm;
pub mod tcp;
pub mod traits;

#[cfg(feature = "bluez")]
pub use bluetooth::{BluezProvider, RfcommConfig};
#[cfg(feature = "bluez")]
pub use bt_discovery::{BtDiscovery, BtDiscoveryConfig};
#[cfg(feature = "bluez")]
pub use rfcomm::{RfcommChannel, DEFAULT_RFCOMM_CHANNEL};
pub use tcp::{SimulatedDevice, TcpChannel, TcpSimProvider};
pub use traits::{BondingStrategy, BoxChannel, Channel, TransportProvider};
