//! Bluetooth RFCOMM link service
//!
//! Discovery, pairing and persistent serial-over-radio connections with
//! keep-alive monitoring. The radio itself sits behind a
//! [`TransportProvider`]: BlueZ (`bluez` feature), a TCP simulation for
//! development, or the [`mock`] provider for tests.

pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod events;
pub mod mock;
pub mod registry;
pub mod service;
pub mod transport;

pub use config::{BluetoothConfig, BluetoothMode, LinkConfig, ServiceConfig};
pub use error::{Error, FaultKind, Result};
pub use events::{
    BondListener, ConnectionListener, DiscoveryListener, EventBridge, EventDispatcher,
    ListenerCategory, Subscription, WriteListener,
};
pub use service::LinkService;
pub use transport::{BondingStrategy, Channel, TransportProvider};

pub use rfcomm_link_shared::{
    BondState, Command, DeviceId, DeviceRecord, LinkState, Notification, ServiceEvent,
};
