//! Connection lifecycle: channel table, connect/teardown, keep-alive and writes
//!
//! This module handles:
//! - At most one channel per device, with force-reconnect replacing stale ones
//! - Per-channel keep-alive monitors with individual cancellation
//! - Writes serialized by a per-channel lock

mod keepalive;
mod manager;
mod table;
mod writer;

pub use keepalive::KeepAlive;
pub use manager::ConnectionManager;
pub use table::{ChannelHandle, ChannelTable};
