//! Bluetooth transport provider backed by BlueZ

use async_trait::async_trait;
use bluer::Adapter;
use futures::stream::{self, BoxStream, StreamExt};
use rfcomm_link_shared::{DeviceId, DeviceRecord};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::transport::bt_discovery::{BtDiscovery, BtDiscoveryConfig};
use crate::transport::rfcomm::{parse_address, RfcommChannel, DEFAULT_RFCOMM_CHANNEL};
use crate::transport::traits::{BondingStrategy, BoxChannel, TransportProvider};

/// Configuration for the BlueZ provider
#[derive(Debug, Clone)]
pub struct RfcommConfig {
    /// RFCOMM channel number of the serial service on the peers
    pub channel: u8,
    /// Discovery configuration
    pub discovery: BtDiscoveryConfig,
}

impl Default for RfcommConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_RFCOMM_CHANNEL,
            discovery: BtDiscoveryConfig::default(),
        }
    }
}

/// Transport provider driving the default BlueZ adapter
pub struct BluezProvider {
    adapter: Adapter,
    config: RfcommConfig,
}

impl BluezProvider {
    /// Open the default adapter and power it on
    pub async fn new(config: RfcommConfig) -> Result<Self> {
        let adapter = BtDiscovery::get_adapter().await?;
        info!("[BT] Using adapter {}", adapter.name());
        Ok(Self { adapter, config })
    }

    fn device(&self, device: &DeviceId) -> Result<bluer::Device> {
        Ok(self.adapter.device(parse_address(device)?)?)
    }
}

#[async_trait]
impl TransportProvider for BluezProvider {
    async fn discover(&self) -> Result<BoxStream<'static, DeviceRecord>> {
        let (tx, rx) = mpsc::channel(32);
        let discovery = BtDiscovery::new(self.config.discovery.clone());
        let adapter = self.adapter.clone();

        tokio::spawn(async move {
            if let Err(e) = discovery.scan(adapter, tx).await {
                warn!("[BT] Discovery failed: {}", e);
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|record| (record, rx))
        })
        .boxed())
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>> {
        BtDiscovery::bonded_devices(&self.adapter).await
    }

    async fn probe_bonding(&self) -> BondingStrategy {
        match self.adapter.set_pairable(true).await {
            Ok(()) => BondingStrategy::Modern,
            Err(e) => {
                warn!("[BT] Adapter refused pairable mode ({}), using link-level bonding", e);
                BondingStrategy::Legacy
            }
        }
    }

    async fn create_bond(&self, device: &DeviceId) -> Result<()> {
        let remote = self.device(device)?;
        if remote.is_paired().await? {
            return Ok(());
        }
        remote.pair().await?;
        Ok(())
    }

    async fn create_bond_legacy(&self, device: &DeviceId) -> Result<()> {
        // Establishing the link makes the stack pair on demand
        let remote = self.device(device)?;
        remote.connect().await?;
        if remote.is_paired().await? {
            Ok(())
        } else {
            Err(Error::Bluetooth(format!(
                "link to {} established without bonding",
                device
            )))
        }
    }

    async fn remove_bond(&self, device: &DeviceId) -> Result<()> {
        self.adapter.remove_device(parse_address(device)?).await?;
        Ok(())
    }

    async fn open_channel(&self, device: &DeviceId) -> Result<BoxChannel> {
        let channel = RfcommChannel::connect(device, self.config.channel).await?;
        Ok(Box::new(channel))
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}
