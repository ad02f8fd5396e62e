use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use crate::{
    config::RadioConfig,
    error::RadioError,
    frame::FRAME_LEN,
    radio::{Radio, RadioMode},
};

pub struct UdpRadio {
    socket: UdpSocket,
    group: SocketAddr,
    mode: RadioMode,
}

impl UdpRadio {
    pub fn open(config: &RadioConfig) -> Result<Self, RadioError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;

        let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        socket.bind(&bind.into())?;
        socket.join_multicast_v4(&config.group, &config.interface)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket: socket.into(),
            group: SocketAddr::V4(SocketAddrV4::new(config.group, config.port)),
            mode: RadioMode::Receive,
        })
    }
}

impl Radio for UdpRadio {
    fn set_mode(&mut self, mode: RadioMode) {
        self.mode = mode;
    }

    fn transmit(&mut self, frame: &[u8; FRAME_LEN]) -> Result<(), RadioError> {
        let written = self.socket.send_to(frame, self.group)?;
        if written != FRAME_LEN {
            return Err(RadioError::NotAcknowledged);
        }
        Ok(())
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        if self.mode != RadioMode::Receive {
            return None;
        }
        let mut buffer = [0u8; 64];
        match self.socket.recv_from(&mut buffer) {
            Ok((len, _)) => Some(buffer[..len].to_vec()),
            Err(err) if err.kind() == ErrorKind::WouldBlock => None,
            Err(err) => {
                warn!("udp radio receive failed: {err}");
                None
            }
        }
    }
}
