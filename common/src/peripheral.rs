use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{
    config::ProtocolConfig,
    error::JoinError,
    frame::{Command, DeviceKind, Frame},
    join::{join_as_peripheral, Enrollment, SyncControl},
    protocol::{Link, RetryPolicy},
    radio::Radio,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Thermostat { current: i32, set: i32, humidity: i32 },
    Register { flow: i32 },
}

impl Role {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Thermostat { .. } => DeviceKind::Thermostat,
            Self::Register { .. } => DeviceKind::Register,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Unjoined,
    Idle,
    Served(Command),
    Rejoined,
}

/// A joined thermostat or register answering controller requests.
pub struct PeripheralNode<R, S> {
    link: Link<R>,
    role: Role,
    sync: S,
    nonce: i32,
    join: RetryPolicy,
    enrollment: Option<Enrollment>,
    idle_polls: u64,
    resync_after: u64,
    poll_interval: Duration,
}

impl<R: Radio, S: SyncControl> PeripheralNode<R, S> {
    /// `nonce` is drawn once per boot and reused for every rejoin.
    pub fn new(link: Link<R>, role: Role, sync: S, nonce: i32, config: &ProtocolConfig) -> Self {
        let poll_ms = config.peripheral_poll_ms.max(1);
        Self {
            link,
            role,
            sync,
            nonce,
            join: config.join_policy(),
            enrollment: None,
            idle_polls: 0,
            resync_after: (config.resync_idle_ms / poll_ms).max(1),
            poll_interval: Duration::from_millis(poll_ms),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn role_mut(&mut self) -> &mut Role {
        &mut self.role
    }

    pub fn enrollment(&self) -> Option<Enrollment> {
        self.enrollment
    }

    /// Keeps the current enrollment when the attempt fails.
    pub fn join(&mut self) -> Result<Enrollment, JoinError> {
        self.idle_polls = 0;
        let enrollment = join_as_peripheral(&mut self.link, self.role.kind(), self.nonce, self.join)?;
        self.enrollment = Some(enrollment);
        Ok(enrollment)
    }

    /// One poll of the radio. Serves a pending request, or counts idle time and
    /// tries a rejoin once the radio has been quiet too long while sync is held.
    pub fn step(&mut self) -> Step {
        if self.enrollment.is_none() {
            return Step::Unjoined;
        }

        if let Some(frame) = self.link.receive() {
            self.idle_polls = 0;
            self.serve(frame);
            return Step::Served(frame.command);
        }

        self.idle_polls += 1;
        if self.idle_polls >= self.resync_after && self.sync.is_engaged() {
            info!("radio idle with sync held, rejoining");
            return match self.join() {
                Ok(_) => Step::Rejoined,
                Err(err) => {
                    debug!("rejoin failed, keeping previous address: {err}");
                    Step::Idle
                }
            };
        }
        Step::Idle
    }

    pub fn run_once(&mut self) -> Step {
        let step = self.step();
        if step == Step::Idle {
            self.link.pause(self.poll_interval);
        }
        step
    }

    fn serve(&mut self, frame: Frame) {
        let reply = match (frame.command, &mut self.role) {
            (Command::GetTemps, Role::Thermostat { current, set, .. }) => {
                Some((Command::ReturnTemps, *current, *set))
            }
            (Command::GetHum, Role::Thermostat { humidity, .. }) => {
                Some((Command::ReturnHum, *humidity, 0))
            }
            (Command::SetTemp, Role::Thermostat { set, .. }) => {
                *set = frame.value1;
                None
            }
            (Command::SetFlow, Role::Register { flow }) => {
                *flow = frame.value1;
                debug!("flow set to {}%", frame.value1);
                None
            }
            (Command::GetFlow, Role::Register { flow }) => Some((Command::ReturnFlow, *flow, 0)),
            (Command::Ack, _) => None,
            (command, _) => {
                debug!("ignoring {command:?} from {}", frame.source);
                None
            }
        };

        if let Some((command, value1, value2)) = reply {
            if let Err(err) = self.link.send_and_expect_ack(frame.source, command, value1, value2) {
                warn!("{command:?} to {} failed: {err}", frame.source);
            }
        }
    }
}
