use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, trace};

use crate::{
    config::ProtocolConfig,
    error::LinkError,
    frame::{Address, Command, Frame},
    radio::Radio,
    transport::Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }
}

pub struct Link<R> {
    transport: Transport<R>,
    ack: RetryPolicy,
    reply: RetryPolicy,
    rng: StdRng,
}

impl<R: Radio> Link<R> {
    pub fn new(radio: R, own: Address, config: &ProtocolConfig) -> Self {
        Self {
            transport: Transport::new(radio, own),
            ack: config.ack_policy(),
            reply: config.reply_policy(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn own_address(&self) -> Address {
        self.transport.own_address()
    }

    pub fn set_own_address(&mut self, own: Address) {
        self.transport.set_own_address(own);
    }

    pub fn set_accept_sync(&mut self, accept: bool) {
        self.transport.set_accept_sync(accept);
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn pause(&mut self, duration: Duration) {
        self.transport.pause(duration);
    }

    pub fn send(
        &mut self,
        destination: Address,
        command: Command,
        value1: i32,
        value2: i32,
    ) -> Result<(), LinkError> {
        self.transport
            .send_frame(destination, command, value1, value2)
            .map_err(|err| LinkError::Send(destination, err))
    }

    /// Raw poll without auto-ACK. The join handshake listens this way.
    pub fn poll(&mut self) -> Option<Frame> {
        self.transport.poll_frame()
    }

    pub fn send_and_expect_ack(
        &mut self,
        destination: Address,
        command: Command,
        value1: i32,
        value2: i32,
    ) -> Result<(), LinkError> {
        let value1 = if value1 == 0 && command.wants_ack_token() {
            self.rng.gen_range(1..=i32::MAX)
        } else {
            value1
        };
        self.send(destination, command, value1, value2)?;

        for _ in 0..self.ack.attempts {
            if let Some(frame) = self.transport.poll_frame() {
                if frame.acknowledges(destination, command, value1) {
                    return Ok(());
                }
                trace!("ignoring {:?} from {} while awaiting ACK", frame.command, frame.source);
            }
            self.transport.pause(self.ack.interval);
        }

        debug!("{command:?} to {destination} was not acknowledged");
        Err(LinkError::AckTimeout(destination, self.ack.attempts))
    }

    /// Next delivered frame. Data frames are acknowledged before they are returned;
    /// join frames and ACKs are passed through untouched.
    pub fn receive(&mut self) -> Option<Frame> {
        let frame = self.transport.poll_frame()?;
        if !frame.command.is_join() && frame.command != Command::Ack {
            let ack = frame.ack(self.transport.own_address());
            if let Err(err) =
                self.transport
                    .send_frame(ack.destination, ack.command, ack.value1, ack.value2)
            {
                debug!("ACK to {} failed: {err}", frame.source);
            }
        }
        Some(frame)
    }

    /// Waits for `command` from `source`, acknowledging whatever arrives meanwhile.
    pub fn await_reply(&mut self, source: Address, command: Command) -> Result<Frame, LinkError> {
        for _ in 0..self.reply.attempts {
            if let Some(frame) = self.receive() {
                if frame.source == source && frame.command == command {
                    return Ok(frame);
                }
            }
            self.transport.pause(self.reply.interval);
        }
        Err(LinkError::ReplyTimeout(source, self.reply.attempts))
    }

    pub fn request(
        &mut self,
        destination: Address,
        command: Command,
        reply: Command,
    ) -> Result<Frame, LinkError> {
        self.send_and_expect_ack(destination, command, 0, 0)?;
        self.await_reply(destination, reply)
    }
}
