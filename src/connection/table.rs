//! Channel table: the single source of truth for "is this device connected"

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rfcomm_link_shared::{DeviceId, LinkEvent, LinkState, LinkStateMachine, TransitionResult};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::BoxChannel;

/// An installed channel.
///
/// Every write, probe and close goes through the writer lock, so at most
/// one operation touches the underlying stream at a time. Closing first
/// aborts a write that is stuck waiting on the peer.
pub struct ChannelHandle {
    device: DeviceId,
    generation: u64,
    writer: tokio::sync::Mutex<BoxChannel>,
    closing: CancellationToken,
    monitor: Mutex<Option<(u64, CancellationToken)>>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("device", &self.device)
            .field("generation", &self.generation)
            .field("monitored", &self.is_monitored())
            .finish()
    }
}

impl ChannelHandle {
    fn new(device: DeviceId, generation: u64, channel: BoxChannel) -> Self {
        Self {
            device,
            generation,
            writer: tokio::sync::Mutex::new(channel),
            closing: CancellationToken::new(),
            monitor: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Distinguishes this channel from earlier and later ones for the same device
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write the whole buffer under the channel's write lock
    pub async fn write_all(&self, bytes: &[u8]) -> Result<usize> {
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(bytes).await?;
            writer.flush().await
        };

        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("channel to {} is closing", self.device),
            ))),
            result = write => {
                result?;
                Ok(bytes.len())
            }
        }
    }

    /// Stop the monitor and close the underlying channel.
    ///
    /// A write in progress is abandoned so the writer lock is released.
    pub async fn close(&self) -> Result<()> {
        self.closing.cancel();
        self.stop_monitor();
        let mut writer = self.writer.lock().await;
        writer.close().await
    }

    fn lock_monitor(&self) -> MutexGuard<'_, Option<(u64, CancellationToken)>> {
        self.monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install a monitor token, cancelling the one it replaces
    pub(crate) fn set_monitor(&self, id: u64, token: CancellationToken) {
        if let Some((_, previous)) = self.lock_monitor().replace((id, token)) {
            debug!("[MONITOR] Replacing monitor on {}", self.device);
            previous.cancel();
        }
    }

    /// Forget the monitor `id` if it is still the installed one
    pub(crate) fn clear_monitor(&self, id: u64) -> bool {
        let mut monitor = self.lock_monitor();
        match monitor.as_ref() {
            Some((current, _)) if *current == id => {
                *monitor = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel the running monitor, if any
    pub fn stop_monitor(&self) -> bool {
        match self.lock_monitor().take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_monitored(&self) -> bool {
        self.lock_monitor()
            .as_ref()
            .is_some_and(|(_, token)| !token.is_cancelled())
    }
}

#[derive(Default)]
struct TableInner {
    channels: HashMap<DeviceId, Arc<ChannelHandle>>,
    states: HashMap<DeviceId, LinkStateMachine>,
}

impl TableInner {
    fn transition(&mut self, device: &DeviceId, event: LinkEvent) -> LinkState {
        let fsm = self.states.entry(device.clone()).or_default();
        match fsm.process_event(event) {
            TransitionResult::Changed(state) => {
                debug!("[LINK] {} -> {}", device, state.as_str());
                state
            }
            TransitionResult::Unchanged(state) => state,
            TransitionResult::Invalid { from, event } => {
                trace!("[LINK] Ignoring {:?} for {} in {}", event, device, from.as_str());
                from
            }
        }
    }
}

/// Mapping from device identifier to its open channel.
///
/// The lock is never held across an await point.
#[derive(Default)]
pub struct ChannelTable {
    inner: Mutex<TableInner>,
    next_generation: AtomicU64,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, device: &DeviceId) -> Option<Arc<ChannelHandle>> {
        self.lock().channels.get(device).cloned()
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.lock().channels.contains_key(device)
    }

    /// Install a freshly opened channel unless `guard` was cancelled.
    ///
    /// The cancellation check and the insert happen under the table lock, so
    /// a teardown that cancels `guard` and then drains the table can never
    /// miss the channel. On refusal the channel is handed back for closing.
    pub fn install(
        &self,
        device: &DeviceId,
        channel: BoxChannel,
        guard: &CancellationToken,
    ) -> std::result::Result<(Arc<ChannelHandle>, Option<Arc<ChannelHandle>>), BoxChannel> {
        let mut inner = self.lock();
        if guard.is_cancelled() {
            return Err(channel);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(ChannelHandle::new(device.clone(), generation, channel));
        let replaced = inner.channels.insert(device.clone(), Arc::clone(&handle));
        inner.transition(device, LinkEvent::ChannelOpened);
        Ok((handle, replaced))
    }

    /// Remove whatever channel is installed for `device`
    pub fn remove(&self, device: &DeviceId, event: LinkEvent) -> Option<Arc<ChannelHandle>> {
        let mut inner = self.lock();
        let removed = inner.channels.remove(device);
        if removed.is_some() {
            inner.transition(device, event);
        }
        removed
    }

    /// Remove `handle` only if it is still the installed channel for its device
    pub fn remove_exact(&self, handle: &ChannelHandle, event: LinkEvent) -> bool {
        let mut inner = self.lock();
        let current = inner
            .channels
            .get(handle.device())
            .map(|h| h.generation());
        if current != Some(handle.generation()) {
            return false;
        }
        inner.channels.remove(handle.device());
        inner.transition(handle.device(), event);
        true
    }

    /// Empty the table, returning every channel it held
    pub fn drain(&self) -> Vec<Arc<ChannelHandle>> {
        let mut inner = self.lock();
        let drained: Vec<_> = inner.channels.drain().map(|(_, h)| h).collect();
        for handle in &drained {
            inner.transition(handle.device(), LinkEvent::Closed);
        }
        drained
    }

    /// Feed a lifecycle event to the device's state machine
    pub fn transition(&self, device: &DeviceId, event: LinkEvent) -> LinkState {
        self.lock().transition(device, event)
    }

    /// Record a monitor state change, only while `handle` is still installed
    pub(crate) fn transition_exact(&self, handle: &ChannelHandle, event: LinkEvent) {
        let mut inner = self.lock();
        let installed = inner
            .channels
            .get(handle.device())
            .is_some_and(|h| h.generation() == handle.generation());
        if installed {
            inner.transition(handle.device(), event);
        }
    }

    pub fn link_state(&self, device: &DeviceId) -> LinkState {
        self.lock()
            .states
            .get(device)
            .map(LinkStateMachine::state)
            .unwrap_or_default()
    }

    /// Connected devices in identifier order
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.lock().channels.keys().cloned().collect();
        devices.sort();
        devices
    }

    pub fn any_monitored(&self) -> bool {
        self.lock().channels.values().any(|h| h.is_monitored())
    }

    pub fn len(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().channels.is_empty()
    }
}
