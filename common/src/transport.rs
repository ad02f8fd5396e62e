use tracing::{debug, trace};

use crate::{
    error::RadioError,
    frame::{Address, Command, Frame},
    radio::{Radio, RadioMode},
};

pub struct Transport<R> {
    radio: R,
    own: Address,
    accept_sync: bool,
}

impl<R: Radio> Transport<R> {
    pub fn new(mut radio: R, own: Address) -> Self {
        radio.set_mode(RadioMode::Receive);
        Self {
            radio,
            own,
            accept_sync: false,
        }
    }

    pub fn own_address(&self) -> Address {
        self.own
    }

    pub fn set_own_address(&mut self, own: Address) {
        self.own = own;
    }

    /// While joining, frames addressed to `SYNC` are delivered as well.
    pub fn set_accept_sync(&mut self, accept: bool) {
        self.accept_sync = accept;
    }

    pub fn send_frame(
        &mut self,
        destination: Address,
        command: Command,
        value1: i32,
        value2: i32,
    ) -> Result<(), RadioError> {
        let frame = Frame::new(destination, self.own, command, value1, value2);
        trace!("tx {frame:?}");

        self.radio.set_mode(RadioMode::Transmit);
        let result = self.radio.transmit(&frame.encode());
        self.radio.set_mode(RadioMode::Receive);
        result
    }

    pub fn poll_frame(&mut self) -> Option<Frame> {
        let bytes = self.radio.receive()?;
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("dropping undecodable frame: {err}");
                return None;
            }
        };

        if !self.accepts(&frame) {
            trace!("dropping frame for {}", frame.destination);
            return None;
        }
        trace!("rx {frame:?}");
        Some(frame)
    }

    pub fn pause(&mut self, duration: std::time::Duration) {
        self.radio.pause(duration);
    }

    fn accepts(&self, frame: &Frame) -> bool {
        // Our own broadcasts come back on shared media.
        if frame.source == self.own && self.own != Address::BROADCAST {
            return false;
        }
        frame.destination == self.own
            || frame.destination == Address::BROADCAST
            || (self.accept_sync && frame.destination == Address::SYNC)
    }
}
