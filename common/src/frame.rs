use std::fmt;

use serde::{Serialize, Serializer};

use crate::error::FrameError;

pub const FRAME_LEN: usize = 12;

/// High bit of an address (and of the `CREATE_ADDR` type tag) marks a thermostat.
pub const THERMOSTAT_TAG: u8 = 0x80;
pub const REGISTER_TAG: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u8);

impl Address {
    pub const BROADCAST: Self = Self(0x00);
    pub const SYNC: Self = Self(0xFF);

    pub fn kind(self) -> DeviceKind {
        if self.0 & THERMOSTAT_TAG != 0 {
            DeviceKind::Thermostat
        } else {
            DeviceKind::Register
        }
    }

    pub fn is_reserved(self) -> bool {
        self == Self::BROADCAST || self == Self::SYNC
    }

    pub fn id(self) -> u8 {
        self.0 & !THERMOSTAT_TAG
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Thermostat,
    Register,
}

impl DeviceKind {
    pub fn tag(self) -> u8 {
        match self {
            Self::Thermostat => THERMOSTAT_TAG,
            Self::Register => REGISTER_TAG,
        }
    }

    pub fn from_tag(value: i32) -> Self {
        if value & THERMOSTAT_TAG as i32 != 0 {
            Self::Thermostat
        } else {
            Self::Register
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thermostat => "thermostat",
            Self::Register => "register",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    SendByte = 0x01,
    ReturnByte = 0x02,
    Ack = 0x03,
    SetTemp = 0x10,
    GetTemps = 0x11,
    ReturnTemps = 0x12,
    GetHum = 0x13,
    ReturnHum = 0x14,
    GetFlow = 0x15,
    ReturnFlow = 0x16,
    SetFlow = 0x17,
    CreateAddr = 0x29,
    SetAddr = 0x2A,
    RejectAddr = 0x2B,
    ReceivedAddr = 0x2C,
    AddrNotSet = 0x2D,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Join-handshake commands are never acknowledged.
    pub fn is_join(self) -> bool {
        matches!(
            self,
            Self::CreateAddr
                | Self::SetAddr
                | Self::RejectAddr
                | Self::ReceivedAddr
                | Self::AddrNotSet
        )
    }

    /// Requests carry no payload in their first value; a zero there is replaced
    /// by a random token so the echoed ACK identifies this particular request.
    pub fn wants_ack_token(self) -> bool {
        matches!(self, Self::GetTemps | Self::GetHum | Self::GetFlow)
    }
}

impl TryFrom<u8> for Command {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let command = match value {
            0x01 => Self::SendByte,
            0x02 => Self::ReturnByte,
            0x03 => Self::Ack,
            0x10 => Self::SetTemp,
            0x11 => Self::GetTemps,
            0x12 => Self::ReturnTemps,
            0x13 => Self::GetHum,
            0x14 => Self::ReturnHum,
            0x15 => Self::GetFlow,
            0x16 => Self::ReturnFlow,
            0x17 => Self::SetFlow,
            0x29 => Self::CreateAddr,
            0x2A => Self::SetAddr,
            0x2B => Self::RejectAddr,
            0x2C => Self::ReceivedAddr,
            0x2D => Self::AddrNotSet,
            other => return Err(FrameError::UnknownCommand(other)),
        };
        Ok(command)
    }
}

/// One radio frame: `[dest][src][cmd][val1: i32 BE][val2: i32 BE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub destination: Address,
    pub source: Address,
    pub command: Command,
    pub value1: i32,
    pub value2: i32,
}

impl Frame {
    pub fn new(
        destination: Address,
        source: Address,
        command: Command,
        value1: i32,
        value2: i32,
    ) -> Self {
        Self {
            destination,
            source,
            command,
            value1,
            value2,
        }
    }

    pub fn ack(&self, own: Address) -> Self {
        Self::new(
            self.source,
            own,
            Command::Ack,
            self.command.code() as i32,
            self.value1,
        )
    }

    /// True when `self` is the ACK for a request `(command, value1)` sent to `peer`.
    pub fn acknowledges(&self, peer: Address, command: Command, value1: i32) -> bool {
        self.command == Command::Ack
            && self.source == peer
            && self.value1 == command.code() as i32
            && self.value2 == value1
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut bytes = [0u8; FRAME_LEN];
        bytes[0] = self.destination.0;
        bytes[1] = self.source.0;
        bytes[2] = self.command.code();
        bytes[3..7].copy_from_slice(&self.value1.to_be_bytes());
        bytes[7..11].copy_from_slice(&self.value2.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != FRAME_LEN {
            return Err(FrameError::Length(bytes.len()));
        }
        let command = Command::try_from(bytes[2])?;
        let mut value1 = [0u8; 4];
        value1.copy_from_slice(&bytes[3..7]);
        let mut value2 = [0u8; 4];
        value2.copy_from_slice(&bytes[7..11]);

        Ok(Self {
            destination: Address(bytes[0]),
            source: Address(bytes[1]),
            command,
            value1: i32::from_be_bytes(value1),
            value2: i32::from_be_bytes(value2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_values_big_endian() {
        let frame = Frame::new(Address(0x81), Address(0x05), Command::ReturnTemps, 72, -3);
        let bytes = frame.encode();

        assert_eq!(bytes[..3], [0x81, 0x05, 0x12]);
        assert_eq!(bytes[3..7], [0, 0, 0, 72]);
        assert_eq!(bytes[7..11], [0xFF, 0xFF, 0xFF, 0xFD]);
        assert_eq!(Frame::decode(&bytes), Ok(frame));
    }

    #[test]
    fn rejects_unknown_command_and_short_buffers() {
        let mut bytes = Frame::new(Address(1), Address(2), Command::Ack, 0, 0).encode();
        bytes[2] = 0x7E;

        assert_eq!(Frame::decode(&bytes), Err(FrameError::UnknownCommand(0x7E)));
        assert_eq!(Frame::decode(&bytes[..11]), Err(FrameError::Length(11)));
    }

    #[test]
    fn ack_echoes_command_and_first_value() {
        let request = Frame::new(Address(0x81), Address(0x05), Command::GetTemps, 4242, 0);
        let ack = request.ack(Address(0x81));

        assert_eq!(ack.destination, Address(0x05));
        assert!(ack.acknowledges(Address(0x81), Command::GetTemps, 4242));
        assert!(!ack.acknowledges(Address(0x81), Command::GetHum, 4242));
        assert!(!ack.acknowledges(Address(0x82), Command::GetTemps, 4242));
    }

    #[test]
    fn high_bit_selects_thermostat() {
        assert_eq!(Address(0x83).kind(), DeviceKind::Thermostat);
        assert_eq!(Address(0x03).kind(), DeviceKind::Register);
        assert_eq!(Address(0x83).id(), 3);
        assert!(Address::SYNC.is_reserved());
    }
}
