//! RFCOMM channel implementation for Bluetooth serial links

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr as RfcommAddr, Stream as RfcommStream};
use bluer::Address;
use rfcomm_link_shared::DeviceId;
use tokio::io::AsyncWrite;
use tracing::info;

use crate::error::{Error, Result};
use crate::transport::traits::Channel;

/// Default RFCOMM channel of the Serial Port Profile service on most modules
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

/// Parse a device identifier into a Bluetooth address
pub fn parse_address(device: &DeviceId) -> Result<Address> {
    device
        .as_str()
        .parse()
        .map_err(|_| Error::InvalidAddress(device.to_string()))
}

/// RFCOMM stream wrapper implementing Channel
pub struct RfcommChannel {
    inner: RfcommStream,
    peer_addr: Address,
}

impl RfcommChannel {
    /// Create a new RFCOMM channel
    pub fn new(stream: RfcommStream, peer_addr: Address) -> Self {
        Self {
            inner: stream,
            peer_addr,
        }
    }

    /// Connect to a device on the given RFCOMM channel number
    pub async fn connect(device: &DeviceId, channel: u8) -> Result<Self> {
        let peer_addr = parse_address(device)?;
        let socket_addr = RfcommAddr::new(peer_addr, channel);
        info!("[BT] Connecting to {} channel {}", peer_addr, channel);

        let stream = RfcommStream::connect(socket_addr)
            .await
            .map_err(|e| Error::ConnectFailed {
                device: device.clone(),
                reason: format!("RFCOMM connect failed: {}", e),
            })?;

        info!("[BT] Connected to {}", peer_addr);
        Ok(Self::new(stream, peer_addr))
    }

    /// Get the peer Bluetooth address
    pub fn peer_address(&self) -> Address {
        self.peer_addr
    }
}

impl AsyncWrite for RfcommChannel {
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
impl Channel for RfcommChannel {
    async fn close(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr = parse_address(&DeviceId::from("00:11:22:33:44:55")).unwrap();
        assert_eq!(addr, Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]));
    }

    #[test]
    fn test_parse_invalid_address() {
        let result = parse_address(&DeviceId::from("not-an-address"));
        assert!(matches!(result, Err(Error::InvalidAddress(_))));
    }
}
