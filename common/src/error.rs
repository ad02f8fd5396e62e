use thiserror::Error;

use crate::frame::{Address, DeviceKind, FRAME_LEN};
use crate::topology::RoomId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame must be {FRAME_LEN} bytes, got {0}")]
    Length(usize),
    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),
}

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("transmission was not acknowledged by the radio")]
    NotAcknowledged,
    #[error("radio i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("send to {0} failed: {1}")]
    Send(Address, #[source] RadioError),
    #[error("no ACK from {0} after {1} polls")]
    AckTimeout(Address, u32),
    #[error("no reply from {0} after {1} polls")]
    ReplyTimeout(Address, u32),
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("address request rejected by the controller")]
    Rejected,
    #[error("join handshake timed out")]
    Timeout,
    #[error("device declined the offered address")]
    NotConfirmed,
    #[error("sync control released before a device joined")]
    SyncReleased,
    #[error("device limit of {0} reached")]
    DeviceLimit(usize),
    #[error("no thermostat has joined yet; registers need a room")]
    NoRoom,
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("address {0} is not part of the topology")]
    UnknownAddress(Address),
    #[error("room {0} does not exist")]
    UnknownRoom(RoomId),
    #[error("address {0} is already assigned")]
    Duplicate(Address),
    #[error("address {0} is not a {1}")]
    WrongKind(Address, DeviceKind),
    #[error("address {0} is reserved")]
    Reserved(Address),
}
