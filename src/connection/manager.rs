//! Connection manager: opens channels, replaces stale ones and tears them down

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rfcomm_link_shared::{DeviceId, LinkEvent, LinkState, Notification};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::table::{ChannelHandle, ChannelTable};
use crate::error::{Error, Result};
use crate::events::EventDispatcher;
use crate::transport::TransportProvider;

/// Owns the channel table and every transition in and out of it
pub struct ConnectionManager {
    pub(super) provider: Arc<dyn TransportProvider>,
    pub(super) table: ChannelTable,
    pub(super) events: Arc<EventDispatcher>,
    /// Serializes close-stale / open / install per device
    connect_locks: Mutex<HashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>>,
    /// Parent of every connect attempt and monitor; replaced on teardown
    root: Mutex<CancellationToken>,
}

impl ConnectionManager {
    pub fn new(provider: Arc<dyn TransportProvider>, events: Arc<EventDispatcher>) -> Self {
        Self {
            provider,
            table: ChannelTable::new(),
            events,
            connect_locks: Mutex::new(HashMap::new()),
            root: Mutex::new(CancellationToken::new()),
        }
    }

    fn lock_root(&self) -> MutexGuard<'_, CancellationToken> {
        self.root
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Token cancelled by the next teardown
    pub(super) fn root_token(&self) -> CancellationToken {
        self.lock_root().clone()
    }

    fn connect_lock(&self, device: &DeviceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .connect_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(device.clone()).or_default())
    }

    /// Forget the connect lock of `device` once nobody else holds or awaits it
    fn release_connect_lock(&self, device: &DeviceId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .connect_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map, one in `lock`
        if Arc::strong_count(&lock) == 2 {
            locks.remove(device);
        }
    }

    /// Start a connect attempt in the background.
    ///
    /// `connectionStarted` is emitted before this returns. An existing channel
    /// for the device is closed and replaced.
    pub fn connect(self: &Arc<Self>, device: DeviceId) -> JoinHandle<Result<()>> {
        self.events.connection_started(&device);
        let guard = self.root_token();
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.connect_now(&device, guard).await })
    }

    async fn connect_now(&self, device: &DeviceId, guard: CancellationToken) -> Result<()> {
        let lock = self.connect_lock(device);
        let result = {
            let _serialized = lock.lock().await;
            self.open_and_install(device, &guard).await
        };
        self.release_connect_lock(device, lock);

        match result {
            Ok(()) => {
                info!("[LINK] Connected to {} via {}", device, self.provider.name());
                self.events.connection_established(device);
                self.events.notify(Notification::Connected(device.clone()));
                Ok(())
            }
            Err(e) => {
                warn!("[LINK] Connection to {} failed: {}", device, e);
                self.table.transition(device, LinkEvent::ConnectFailed);
                self.events.connection_error(device, &e);
                Err(e)
            }
        }
    }

    async fn open_and_install(&self, device: &DeviceId, guard: &CancellationToken) -> Result<()> {
        // Force-reconnect: the stale channel is closed before the new one opens
        if let Some(stale) = self.table.remove(device, LinkEvent::Closed) {
            info!("[LINK] Closing existing channel to {} before reconnecting", device);
            if let Err(e) = stale.close().await {
                debug!("[LINK] Closing stale channel to {} failed: {}", device, e);
            }
        }

        self.table.transition(device, LinkEvent::ConnectRequested);

        let channel = tokio::select! {
            result = self.provider.open_channel(device) => result?,
            _ = guard.cancelled() => return Err(Error::Cancelled),
        };

        match self.table.install(device, channel, guard) {
            Ok((_, None)) => Ok(()),
            Ok((_, Some(replaced))) => {
                // Only reachable if a channel was installed outside the connect lock
                warn!("[LINK] Replaced an unexpected channel to {}", device);
                if let Err(e) = replaced.close().await {
                    debug!("[LINK] Closing replaced channel to {} failed: {}", device, e);
                }
                Ok(())
            }
            Err(mut channel) => {
                debug!("[LINK] Teardown raced connect to {}, closing new channel", device);
                if let Err(e) = channel.close().await {
                    debug!("[LINK] Closing refused channel to {} failed: {}", device, e);
                }
                Err(Error::Cancelled)
            }
        }
    }

    /// Close the channel for `device` on request
    pub async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        let lock = self.connect_lock(device);
        let result = {
            let _serialized = lock.lock().await;
            self.close_on_request(device).await
        };
        self.release_connect_lock(device, lock);
        result
    }

    async fn close_on_request(&self, device: &DeviceId) -> Result<()> {
        let handle = self
            .table
            .remove(device, LinkEvent::Closed)
            .ok_or_else(|| Error::NotConnected(device.clone()))?;

        info!("[LINK] Disconnecting {}", device);
        if let Err(e) = handle.close().await {
            debug!("[LINK] Close of {} reported: {}", device, e);
        }
        self.events.disconnected(device);
        self.events.notify(Notification::Disconnected(device.clone()));
        Ok(())
    }

    /// The link to `device` was lost: drop its channel and report it.
    ///
    /// Returns false when no channel was installed.
    pub async fn disconnect_detected(&self, device: &DeviceId) -> bool {
        match self.table.remove(device, LinkEvent::LinkLost) {
            Some(handle) => {
                self.report_lost(&handle).await;
                true
            }
            None => {
                debug!("[LINK] Disconnect of {} detected but no channel installed", device);
                false
            }
        }
    }

    /// Like [`disconnect_detected`](Self::disconnect_detected) but only if
    /// `handle` is still the installed channel.
    pub(super) async fn channel_lost(&self, handle: &ChannelHandle) -> bool {
        if !self.table.remove_exact(handle, LinkEvent::LinkLost) {
            debug!(
                "[LINK] Lost channel to {} was already replaced",
                handle.device()
            );
            return false;
        }
        self.report_lost(handle).await;
        true
    }

    async fn report_lost(&self, handle: &ChannelHandle) {
        let device = handle.device();
        warn!("[LINK] Link to {} lost", device);
        if let Err(e) = handle.close().await {
            debug!("[LINK] Close of lost channel to {} reported: {}", device, e);
        }
        self.events.disconnected(device);
        self.events.notify(Notification::Disconnected(device.clone()));
    }

    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.table.contains(device)
    }

    pub fn link_state(&self, device: &DeviceId) -> LinkState {
        self.table.link_state(device)
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.table.devices()
    }

    pub fn table(&self) -> &ChannelTable {
        &self.table
    }

    /// Stop every monitor, close every channel and announce it once
    pub async fn teardown(&self) {
        let previous = {
            let mut root = self.lock_root();
            std::mem::replace(&mut *root, CancellationToken::new())
        };
        // Cancel before draining so a racing install is refused
        previous.cancel();

        let handles = self.table.drain();
        info!("[LINK] Tearing down {} channels", handles.len());
        for handle in handles {
            if let Err(e) = handle.close().await {
                warn!("[LINK] Closing {} during teardown failed: {}", handle.device(), e);
            }
        }

        self.events.notify(Notification::AllConnectionsTornDown);
    }
}
