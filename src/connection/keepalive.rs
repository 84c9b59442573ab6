//! Keep-alive monitor
//!
//! One task per monitored channel writes a sentinel byte, sleeps, and
//! repeats. A failed probe means the link is gone: the channel is dropped
//! from the table and `disconnected` is emitted. Each monitor has its own
//! cancellation token, a child of the manager's root token, so a single
//! channel can be stopped and a teardown stops all of them at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rfcomm_link_shared::{keepalive, DeviceId, LinkEvent};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::ConnectionManager;
use super::table::ChannelHandle;
use crate::error::{Error, Result};

static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// Probe parameters
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    pub interval: Duration,
    pub sentinel: u8,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(keepalive::PROBE_INTERVAL_MS),
            sentinel: keepalive::SENTINEL,
        }
    }
}

impl ConnectionManager {
    /// Start monitoring the channel of `device`.
    ///
    /// Fails fast with [`Error::NotConnected`] when no channel is installed.
    /// A monitor already running on the channel is replaced.
    pub fn monitor(
        self: &Arc<Self>,
        device: &DeviceId,
        params: KeepAlive,
    ) -> Result<JoinHandle<()>> {
        let handle = self
            .table
            .get(device)
            .ok_or_else(|| Error::NotConnected(device.clone()))?;

        let id = NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed);
        let token = self.root_token().child_token();
        handle.set_monitor(id, token.clone());
        self.table.transition_exact(&handle, LinkEvent::MonitorStarted);
        info!(
            "[MONITOR] Monitoring {} every {:?}",
            device, params.interval
        );

        let manager = Arc::clone(self);
        Ok(tokio::spawn(async move {
            run(&manager, &handle, id, token, params).await;
        }))
    }

    /// Stop the monitor of `device`; false if none was running
    pub fn stop_monitor(&self, device: &DeviceId) -> Result<bool> {
        let handle = self
            .table
            .get(device)
            .ok_or_else(|| Error::NotConnected(device.clone()))?;
        Ok(handle.stop_monitor())
    }

    /// True while at least one channel has a live monitor
    pub fn is_monitoring(&self) -> bool {
        self.table.any_monitored()
    }
}

async fn run(
    manager: &ConnectionManager,
    handle: &Arc<ChannelHandle>,
    id: u64,
    token: CancellationToken,
    params: KeepAlive,
) {
    let device = handle.device();
    let probe = [params.sentinel];

    loop {
        if token.is_cancelled() {
            break;
        }

        if let Err(e) = handle.write_all(&probe).await {
            if token.is_cancelled() {
                // Channel was closed under us by a disconnect or teardown
                break;
            }
            warn!("[MONITOR] Probe to {} failed: {}", device, e);
            handle.clear_monitor(id);
            manager.channel_lost(handle).await;
            return;
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(params.interval) => {}
        }
    }

    debug!("[MONITOR] Monitor on {} stopped", device);
    handle.clear_monitor(id);
    if !handle.is_monitored() {
        manager
            .table
            .transition_exact(handle, LinkEvent::MonitorStopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDispatcher;
    use crate::mock::MockProvider;
    use rfcomm_link_shared::LinkState;

    fn params() -> KeepAlive {
        KeepAlive {
            interval: Duration::from_millis(20),
            sentinel: 0x00,
        }
    }

    async fn connected(provider: &MockProvider, id: &DeviceId) -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(provider.clone()),
            Arc::new(EventDispatcher::new(16)),
        ));
        manager.connect(id.clone()).await.unwrap().unwrap();
        manager
    }

    #[tokio::test]
    async fn test_monitor_requires_channel() {
        let provider = MockProvider::new();
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(provider),
            Arc::new(EventDispatcher::new(16)),
        ));
        let result = manager.monitor(&DeviceId::from("AA:BB"), params());
        assert!(matches!(result, Err(Error::NotConnected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_writes_sentinels() {
        let provider = MockProvider::new();
        let id = DeviceId::from("AA:BB");
        let manager = connected(&provider, &id).await;

        let task = manager.monitor(&id, params()).unwrap();
        assert!(manager.is_monitoring());
        assert_eq!(manager.link_state(&id), LinkState::Monitoring);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.stop_monitor(&id).unwrap());
        task.await.unwrap();

        let written = provider.last_channel(&id).unwrap().written();
        assert!(written.len() >= 2);
        assert!(written.iter().all(|b| *b == 0x00));
        assert!(!manager.is_monitoring());
        assert!(manager.is_connected(&id));
        assert_eq!(manager.link_state(&id), LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_removes_channel() {
        let provider = MockProvider::new();
        let id = DeviceId::from("AA:BB");
        let manager = connected(&provider, &id).await;

        let task = manager.monitor(&id, params()).unwrap();
        provider.last_channel(&id).unwrap().set_fail_writes(true);
        task.await.unwrap();

        assert!(!manager.is_connected(&id));
        assert!(!manager.is_monitoring());
        assert_eq!(manager.link_state(&id), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarting_monitor_replaces_previous() {
        let provider = MockProvider::new();
        let id = DeviceId::from("AA:BB");
        let manager = connected(&provider, &id).await;

        let first = manager.monitor(&id, params()).unwrap();
        let second = manager.monitor(&id, params()).unwrap();
        first.await.unwrap();

        assert!(manager.is_monitoring());
        assert_eq!(manager.link_state(&id), LinkState::Monitoring);

        manager.teardown().await;
        second.await.unwrap();
        assert!(!manager.is_monitoring());
    }
}
