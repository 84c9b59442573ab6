//! TCP simulation transport for development without a radio

use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Mutex;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use rfcomm_link_shared::{BondState, DeviceId, DeviceRecord};
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::traits::{BoxChannel, Channel, TransportProvider};

/// A device simulated by a TCP endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedDevice {
    pub id: DeviceId,
    /// `host:port` of the peer standing in for the device
    pub address: String,
    pub name: Option<String>,
}

impl FromStr for SimulatedDevice {
    type Err = Error;

    /// Parse `id=host:port[,name]`
    fn from_str(s: &str) -> Result<Self> {
        let (id, target) = s
            .split_once('=')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        let (address, name) = match target.split_once(',') {
            Some((address, name)) => (address, Some(name.trim().to_string())),
            None => (target, None),
        };

        let id = id.trim();
        let address = address.trim();
        if id.is_empty() || address.is_empty() {
            return Err(Error::InvalidAddress(s.to_string()));
        }

        Ok(Self {
            id: DeviceId::from(id),
            address: address.to_string(),
            name: name.filter(|n| !n.is_empty()),
        })
    }
}

/// TCP stream wrapper implementing Channel
pub struct TcpChannel {
    inner: TcpStream,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self { inner: stream }
    }
}

impl AsyncWrite for TcpChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn close(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// Transport provider backed by TCP endpoints standing in for devices
pub struct TcpSimProvider {
    devices: Vec<SimulatedDevice>,
    bonded: Mutex<HashSet<DeviceId>>,
}

impl TcpSimProvider {
    /// Create a provider for the given simulated devices
    pub fn new(devices: Vec<SimulatedDevice>) -> Self {
        Self {
            devices,
            bonded: Mutex::new(HashSet::new()),
        }
    }

    fn find(&self, device: &DeviceId) -> Result<&SimulatedDevice> {
        self.devices
            .iter()
            .find(|d| &d.id == device)
            .ok_or_else(|| Error::UnknownDevice(device.clone()))
    }

    fn bonded_ids(&self) -> HashSet<DeviceId> {
        self.bonded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_bonded(&self, device: &DeviceId, bonded: bool) {
        let mut set = self
            .bonded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if bonded {
            set.insert(device.clone());
        } else {
            set.remove(device);
        }
    }

    fn record(&self, device: &SimulatedDevice, bonded: &HashSet<DeviceId>) -> DeviceRecord {
        let bond_state = if bonded.contains(&device.id) {
            BondState::Bonded
        } else {
            BondState::None
        };
        DeviceRecord::new(device.id.clone(), device.name.clone(), bond_state)
    }
}

#[async_trait]
impl TransportProvider for TcpSimProvider {
    async fn discover(&self) -> Result<BoxStream<'static, DeviceRecord>> {
        let bonded = self.bonded_ids();
        let records: Vec<DeviceRecord> = self
            .devices
            .iter()
            .map(|d| self.record(d, &bonded))
            .collect();
        info!("[SIM] Discovery yields {} simulated devices", records.len());
        Ok(stream::iter(records).boxed())
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>> {
        let bonded = self.bonded_ids();
        Ok(self
            .devices
            .iter()
            .filter(|d| bonded.contains(&d.id))
            .map(|d| self.record(d, &bonded))
            .collect())
    }

    async fn create_bond(&self, device: &DeviceId) -> Result<()> {
        self.find(device)?;
        self.set_bonded(device, true);
        debug!("[SIM] Bonded {}", device);
        Ok(())
    }

    async fn remove_bond(&self, device: &DeviceId) -> Result<()> {
        self.find(device)?;
        self.set_bonded(device, false);
        debug!("[SIM] Unbonded {}", device);
        Ok(())
    }

    async fn open_channel(&self, device: &DeviceId) -> Result<BoxChannel> {
        let target = self.find(device)?;
        info!("[SIM] Connecting to {} at {}", device, target.address);

        let stream = TcpStream::connect(&target.address)
            .await
            .map_err(|e| Error::ConnectFailed {
                device: device.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        Ok(Box::new(TcpChannel::new(stream)))
    }

    fn name(&self) -> &'static str {
        "TcpSimulation"
    }
}
