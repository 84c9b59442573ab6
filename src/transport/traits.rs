//! Transport trait abstraction for pluggable radio backends

use async_trait::async_trait;
use futures::stream::BoxStream;
use rfcomm_link_shared::{DeviceId, DeviceRecord};
use tokio::io::AsyncWrite;

use crate::error::{Error, Result};

/// An open serial channel to one device
#[async_trait]
pub trait Channel: AsyncWrite + Send + Unpin + 'static {
    /// Close the channel gracefully
    async fn close(&mut self) -> Result<()>;
}

/// Boxed channel as held by the channel table
pub type BoxChannel = Box<dyn Channel>;

/// How bonding requests are issued on this platform.
///
/// Negotiated once when the service is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondingStrategy {
    /// The platform exposes an explicit bonding call
    Modern,
    /// Bonding happens as a side effect of an alternate invocation path
    Legacy,
}

/// Radio primitives consumed by the link service
#[async_trait]
pub trait TransportProvider: Send + Sync + 'static {
    /// Run one discovery scan; the stream ends when the scan window ends
    async fn discover(&self) -> Result<BoxStream<'static, DeviceRecord>>;

    /// Current snapshot of bonded devices
    async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Select the bonding strategy supported by the platform
    async fn probe_bonding(&self) -> BondingStrategy {
        BondingStrategy::Modern
    }

    /// Bond with a device through the explicit bonding call
    async fn create_bond(&self, device: &DeviceId) -> Result<()>;

    /// Bond with a device through the alternate path
    async fn create_bond_legacy(&self, device: &DeviceId) -> Result<()> {
        Err(Error::BondingUnsupported(format!(
            "{} has no legacy bonding path for {}",
            self.name(),
            device
        )))
    }

    /// Remove the bond with a device
    async fn remove_bond(&self, device: &DeviceId) -> Result<()>;

    /// Open a serial channel to a device (blocks until connected or failed)
    async fn open_channel(&self, device: &DeviceId) -> Result<BoxChannel>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
