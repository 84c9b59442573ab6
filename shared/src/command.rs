//! Commands accepted by the link service and requests of the control socket

use bytes::Bytes;

use crate::DeviceId;

/// Commands issued into the link service.
///
/// Each command returns immediately; outcomes arrive as events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run a full discovery scan
    Discover,
    /// Bond with a device
    Pair(DeviceId),
    /// Remove the bond with a device
    Unpair(DeviceId),
    /// Open (or re-open) the serial channel to a device
    Connect(DeviceId),
    /// Close the serial channel to a device
    Disconnect(DeviceId),
    /// Write bytes to the device's channel
    Write(DeviceId, Bytes),
    /// Start probing the device's channel for silent disconnection
    Monitor(DeviceId),
    /// Stop probing the device's channel
    StopMonitor(DeviceId),
    /// Close every channel and stop every monitor
    Teardown,
}

impl Command {
    /// Device targeted by this command, if any
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Command::Pair(id)
            | Command::Unpair(id)
            | Command::Connect(id)
            | Command::Disconnect(id)
            | Command::Write(id, _)
            | Command::Monitor(id)
            | Command::StopMonitor(id) => Some(id),
            Command::Discover | Command::Teardown => None,
        }
    }
}

/// A request line on the control socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Execute a service command
    Command(Command),
    /// List bonded devices as reported by the transport
    Paired,
    /// List devices seen during discovery
    Devices,
    /// Report the link state of one device
    Status(DeviceId),
}

impl From<Command> for Request {
    fn from(command: Command) -> Self {
        Request::Command(command)
    }
}
