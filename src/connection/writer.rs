//! Serialized writes to installed channels

use std::sync::Arc;

use bytes::Bytes;
use rfcomm_link_shared::DeviceId;
use tracing::{debug, warn};

use super::manager::ConnectionManager;
use super::table::ChannelHandle;
use crate::error::{Error, Result};

impl ConnectionManager {
    /// Write in the background; the outcome arrives as write events.
    ///
    /// Without a channel `writeError` is emitted before this returns and
    /// nothing is spawned.
    pub fn write(self: &Arc<Self>, device: &DeviceId, bytes: Bytes) {
        let Some(handle) = self.channel_for_write(device) else {
            return;
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _ = manager.write_to(&handle, &bytes).await;
        });
    }

    /// Write and wait for the outcome, emitting the same events as [`write`](Self::write)
    pub async fn write_and_wait(&self, device: &DeviceId, bytes: &[u8]) -> Result<usize> {
        match self.channel_for_write(device) {
            Some(handle) => self.write_to(&handle, bytes).await,
            None => Err(Error::NotConnected(device.clone())),
        }
    }

    fn channel_for_write(&self, device: &DeviceId) -> Option<Arc<ChannelHandle>> {
        let handle = self.table.get(device);
        if handle.is_none() {
            let err = Error::NotConnected(device.clone());
            debug!("[LINK] Write to {} refused: {}", device, err);
            self.events.write_error(device, &err);
        }
        handle
    }

    async fn write_to(&self, handle: &ChannelHandle, bytes: &[u8]) -> Result<usize> {
        let device = handle.device();
        self.events.write_started(device);
        match handle.write_all(bytes).await {
            Ok(n) => {
                debug!("[LINK] Wrote {} bytes to {}", n, device);
                self.events.write_finished(device, n);
                Ok(n)
            }
            Err(e) => {
                warn!("[LINK] Write to {} failed: {}", device, e);
                self.events.write_error(device, &e);
                Err(e)
            }
        }
    }
}
