//! Mock transport for testing without a radio.
//!
//! [`MockProvider`] scripts discovery results, bonded devices and connect
//! failures, and records every byte written to the channels it hands out.
//!
//! ```ignore
//! use rfcomm_link::mock::MockProvider;
//!
//! let provider = MockProvider::new().with_device(DeviceRecord::unknown("AA:BB"));
//! provider.set_connect_failure(&"CC:DD".into(), true);
//! ```

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use rfcomm_link_shared::{BondState, DeviceId, DeviceRecord};
use tokio::io::AsyncWrite;

use crate::error::{Error, Result};
use crate::transport::{BondingStrategy, BoxChannel, Channel, TransportProvider};

/// Observable state of one channel handed out by the mock
#[derive(Debug, Default)]
pub struct ChannelLog {
    written: Mutex<Vec<u8>>,
    write_calls: AtomicUsize,
    closed: AtomicBool,
    fail_writes: AtomicBool,
}

impl ChannelLog {
    /// Every byte accepted by the channel, in order
    pub fn written(&self) -> Vec<u8> {
        self.written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of successful `poll_write` calls
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make every following write fail as if the peer went away
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

/// Channel handed out by [`MockProvider`]
pub struct MockChannel {
    log: Arc<ChannelLog>,
    chunk_size: Option<usize>,
    yield_next: bool,
    stalled: bool,
}

impl AsyncWrite for MockChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.log.is_closed() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel closed",
            )));
        }
        if self.log.fail_writes.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer went away",
            )));
        }

        // Peer stopped reading: the write never completes
        if self.stalled {
            return Poll::Pending;
        }

        // Chunked mode: yield between partial writes so interleaving would show
        if self.yield_next {
            self.yield_next = false;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        self.yield_next = self.chunk_size.is_some();

        let n = buf.len().min(self.chunk_size.unwrap_or(buf.len()));
        self.log
            .written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(&buf[..n]);
        self.log.write_calls.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.log.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn close(&mut self) -> Result<()> {
        self.log.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct MockState {
    discoverable: Vec<DeviceRecord>,
    bonded: Vec<DeviceRecord>,
    bonding: BondingStrategy,
    fail_connect: HashSet<DeviceId>,
    fail_bond: HashSet<DeviceId>,
    fail_discovery: bool,
    connect_delay: Duration,
    chunk_size: Option<usize>,
    stall_writes: bool,
    channels: HashMap<DeviceId, Vec<Arc<ChannelLog>>>,
    legacy_bond_calls: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            discoverable: Vec::new(),
            bonded: Vec::new(),
            bonding: BondingStrategy::Modern,
            fail_connect: HashSet::new(),
            fail_bond: HashSet::new(),
            fail_discovery: false,
            connect_delay: Duration::ZERO,
            chunk_size: None,
            stall_writes: false,
            channels: HashMap::new(),
            legacy_bond_calls: 0,
        }
    }
}

/// Scriptable transport provider
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a device reported by discovery (duplicates are reported as given)
    pub fn with_device(self, record: DeviceRecord) -> Self {
        self.lock().discoverable.push(record);
        self
    }

    /// Add a device to the bonded snapshot
    pub fn with_bonded(self, record: DeviceRecord) -> Self {
        self.lock().bonded.push(DeviceRecord {
            bond_state: BondState::Bonded,
            ..record
        });
        self
    }

    /// Strategy reported by the bonding probe
    pub fn with_bonding(self, strategy: BondingStrategy) -> Self {
        self.lock().bonding = strategy;
        self
    }

    /// Delay every channel open by `delay`
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.lock().connect_delay = delay;
        self
    }

    /// Accept at most `size` bytes per write call and yield in between
    pub fn with_write_chunk(self, size: usize) -> Self {
        self.lock().chunk_size = Some(size.max(1));
        self
    }

    /// Channels never accept a byte, like a peer with a full receive buffer
    pub fn with_stalled_writes(self) -> Self {
        self.lock().stall_writes = true;
        self
    }

    pub fn set_connect_failure(&self, device: &DeviceId, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.fail_connect.insert(device.clone());
        } else {
            state.fail_connect.remove(device);
        }
    }

    pub fn set_bond_failure(&self, device: &DeviceId, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.fail_bond.insert(device.clone());
        } else {
            state.fail_bond.remove(device);
        }
    }

    pub fn set_discovery_failure(&self, fail: bool) {
        self.lock().fail_discovery = fail;
    }

    /// Every channel opened for a device, oldest first
    pub fn channels(&self, device: &DeviceId) -> Vec<Arc<ChannelLog>> {
        self.lock().channels.get(device).cloned().unwrap_or_default()
    }

    /// Most recently opened channel for a device
    pub fn last_channel(&self, device: &DeviceId) -> Option<Arc<ChannelLog>> {
        self.lock()
            .channels
            .get(device)
            .and_then(|logs| logs.last().cloned())
    }

    pub fn open_count(&self, device: &DeviceId) -> usize {
        self.lock().channels.get(device).map_or(0, Vec::len)
    }

    pub fn is_bonded(&self, device: &DeviceId) -> bool {
        self.lock().bonded.iter().any(|r| &r.id == device)
    }

    pub fn legacy_bond_calls(&self) -> usize {
        self.lock().legacy_bond_calls
    }

    fn bond(&self, device: &DeviceId) -> Result<()> {
        let mut state = self.lock();
        if state.fail_bond.contains(device) {
            return Err(Error::Bluetooth(format!("bonding with {} rejected", device)));
        }
        if !state.bonded.iter().any(|r| &r.id == device) {
            let record = state
                .discoverable
                .iter()
                .find(|r| &r.id == device)
                .cloned()
                .unwrap_or_else(|| DeviceRecord::unknown(device.clone()));
            state.bonded.push(DeviceRecord {
                bond_state: BondState::Bonded,
                ..record
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TransportProvider for MockProvider {
    async fn discover(&self) -> Result<BoxStream<'static, DeviceRecord>> {
        let state = self.lock();
        if state.fail_discovery {
            return Err(Error::Bluetooth("adapter unavailable".into()));
        }
        Ok(stream::iter(state.discoverable.clone()).boxed())
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.lock().bonded.clone())
    }

    async fn probe_bonding(&self) -> BondingStrategy {
        self.lock().bonding
    }

    async fn create_bond(&self, device: &DeviceId) -> Result<()> {
        self.bond(device)
    }

    async fn create_bond_legacy(&self, device: &DeviceId) -> Result<()> {
        self.lock().legacy_bond_calls += 1;
        self.bond(device)
            .map_err(|e| Error::BondingUnsupported(e.to_string()))
    }

    async fn remove_bond(&self, device: &DeviceId) -> Result<()> {
        self.lock().bonded.retain(|r| &r.id != device);
        Ok(())
    }

    async fn open_channel(&self, device: &DeviceId) -> Result<BoxChannel> {
        let delay = self.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.fail_connect.contains(device) {
            return Err(Error::ConnectFailed {
                device: device.clone(),
                reason: "connection refused".into(),
            });
        }

        let log = Arc::new(ChannelLog::default());
        state
            .channels
            .entry(device.clone())
            .or_default()
            .push(Arc::clone(&log));

        Ok(Box::new(MockChannel {
            log,
            chunk_size: state.chunk_size,
            yield_next: false,
            stalled: state.stall_writes,
        }))
    }

    fn name(&self) -> &'static str {
        "Mock"
    }
}
