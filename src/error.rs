//! Error types for the link service.
//!
//! Every fault is caught at the boundary of the background task that produced
//! it and turned into a listener event; none of them stop the service. There
//! is no automatic retry anywhere, the caller re-issues the command.
//!
//! | Variant | Kind |
//! |---------|------|
//! | [`Error::Io`], [`Error::Bluetooth`], [`Error::ConnectFailed`], [`Error::Cancelled`] | transport fault |
//! | [`Error::NotConnected`], [`Error::InvalidAddress`], [`Error::UnknownDevice`] | protocol misuse |
//! | [`Error::BondingUnsupported`] | platform incompatibility |

use std::io;

use rfcomm_link_shared::DeviceId;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Socket creation, connect, write or close failed
    Transport,
    /// The caller asked for something that cannot apply (e.g. write without a channel)
    ProtocolMisuse,
    /// The platform lacks the requested capability
    PlatformIncompatibility,
}

/// Errors raised by the link service and its transports
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    #[error("Connection to {device} failed: {reason}")]
    ConnectFailed { device: DeviceId, reason: String },

    #[error("Operation cancelled by teardown")]
    Cancelled,

    #[error("No open channel for {0}")]
    NotConnected(DeviceId),

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("Bonding not supported: {0}")]
    BondingUnsupported(String),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> FaultKind {
        match self {
            Error::Io(_) | Error::Bluetooth(_) | Error::ConnectFailed { .. } | Error::Cancelled => {
                FaultKind::Transport
            }
            Error::NotConnected(_) | Error::InvalidAddress(_) | Error::UnknownDevice(_) => {
                FaultKind::ProtocolMisuse
            }
            Error::BondingUnsupported(_) => FaultKind::PlatformIncompatibility,
        }
    }
}

#[cfg(feature = "bluez")]
impl From<bluer::Error> for Error {
    fn from(err: bluer::Error) -> Self {
        Error::Bluetooth(err.to_string())
    }
}
