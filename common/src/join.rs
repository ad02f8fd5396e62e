use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    config::ProtocolConfig,
    error::JoinError,
    frame::{Address, Command, DeviceKind, Frame},
    protocol::{Link, RetryPolicy},
    radio::Radio,
    topology::{RoomId, Topology},
};

/// Highest identifier handed out, so neither `0x00` nor `0xFF` is ever assigned.
pub const MAX_ID: u8 = 126;

pub trait SyncControl {
    fn is_engaged(&self) -> bool;
}

impl SyncControl for AtomicBool {
    fn is_engaged(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

impl<T: SyncControl + ?Sized> SyncControl for Arc<T> {
    fn is_engaged(&self) -> bool {
        (**self).is_engaged()
    }
}

impl<T: SyncControl + ?Sized> SyncControl for &T {
    fn is_engaged(&self) -> bool {
        (**self).is_engaged()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Held;

impl SyncControl for Held {
    fn is_engaged(&self) -> bool {
        true
    }
}

/// Hands out 7-bit identifiers in `1..=MAX_ID`, wrapping. Skips addresses the
/// topology already uses and the controller's own.
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    next: u8,
}

impl AddressAllocator {
    pub fn new(seed: u8) -> Self {
        Self {
            next: wrap_id(seed),
        }
    }

    pub fn peek(&self) -> u8 {
        self.next
    }

    pub fn candidate(
        &mut self,
        kind: DeviceKind,
        topology: &Topology,
        own: Address,
    ) -> Option<Address> {
        for _ in 0..MAX_ID {
            let address = Address(kind.tag() | self.next);
            if address != own && !topology.contains(address) {
                return Some(address);
            }
            self.advance();
        }
        None
    }

    pub fn advance(&mut self) {
        self.next = wrap_id(self.next.wrapping_add(1));
    }
}

fn wrap_id(id: u8) -> u8 {
    if id == 0 || id > MAX_ID {
        1
    } else {
        id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub local: Address,
    pub joined: Vec<Address>,
}

enum Confirm {
    Committed(Address),
    Declined,
}

#[derive(Debug, Clone)]
pub struct Joiner {
    allocator: AddressAllocator,
    designated: Option<RoomId>,
    join: RetryPolicy,
    listen: RetryPolicy,
    max_devices: usize,
}

impl Joiner {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            allocator: AddressAllocator::new(1),
            designated: None,
            join: config.join_policy(),
            listen: config.listen_policy(),
            max_devices: config.max_devices,
        }
    }

    /// Keeps the designated room pointing at the right place after a room was
    /// removed and possibly replaced by the former last room.
    pub fn room_removed(&mut self, removed: RoomId, moved: Option<RoomId>) {
        if self.designated == Some(removed) {
            self.designated = None;
        } else if moved.is_some() && self.designated == moved {
            self.designated = Some(removed);
        }
    }

    /// Picks a fresh local address in `1..=15` and seeds the counter from it.
    pub fn begin_session<R: Radio>(&mut self, link: &mut Link<R>) -> Address {
        let local = link.rng().gen_range(1..=15u8);
        link.set_own_address(Address(local));
        self.allocator = AddressAllocator::new(local);
        self.designated = None;
        info!("sync session: controller address {}", Address(local));
        Address(local)
    }

    /// Admits devices until the sync control is released, the device cap is
    /// reached, or the listen budget passes without any `CREATE_ADDR`.
    pub fn run_session<R: Radio, S: SyncControl>(
        &mut self,
        link: &mut Link<R>,
        topology: &mut Topology,
        sync: &S,
    ) -> SessionReport {
        let local = self.begin_session(link);
        let mut joined = Vec::new();
        let mut idle = 0;

        link.set_accept_sync(true);
        while sync.is_engaged() && topology.device_count() < self.max_devices {
            if idle >= self.listen.attempts {
                debug!("sync session: no join requests, leaving");
                break;
            }
            let Some(frame) = link.poll().filter(|frame| frame.command == Command::CreateAddr)
            else {
                idle += 1;
                link.pause(self.listen.interval);
                continue;
            };
            idle = 0;

            match self.admit(link, topology, frame, None) {
                Ok(Confirm::Committed(address)) => joined.push(address),
                Ok(Confirm::Declined) => {}
                Err(err) => debug!("sync session: {err}"),
            }
        }
        link.set_accept_sync(false);

        info!(
            "sync session finished: {} joined, {} devices total",
            joined.len(),
            topology.device_count()
        );
        SessionReport { local, joined }
    }

    /// Waits for one device of `kind`. Registers go into `room`, or the
    /// designated room when `room` is `None`.
    pub fn join_one<R: Radio, S: SyncControl>(
        &mut self,
        link: &mut Link<R>,
        topology: &mut Topology,
        kind: DeviceKind,
        room: Option<RoomId>,
        sync: &S,
    ) -> Result<Address, JoinError> {
        if topology.device_count() >= self.max_devices {
            return Err(JoinError::DeviceLimit(self.max_devices));
        }
        if kind == DeviceKind::Register {
            let room = room.or(self.designated).ok_or(JoinError::NoRoom)?;
            topology.room(room)?;
        }
        if link.own_address() == Address::BROADCAST {
            self.begin_session(link);
        }

        link.set_accept_sync(true);
        let result = self.listen_for(link, topology, kind, room, sync);
        link.set_accept_sync(false);
        result
    }

    fn listen_for<R: Radio, S: SyncControl>(
        &mut self,
        link: &mut Link<R>,
        topology: &mut Topology,
        kind: DeviceKind,
        room: Option<RoomId>,
        sync: &S,
    ) -> Result<Address, JoinError> {
        for _ in 0..self.listen.attempts {
            if !sync.is_engaged() {
                return Err(JoinError::SyncReleased);
            }
            if let Some(frame) = link.poll() {
                if frame.command == Command::CreateAddr
                    && DeviceKind::from_tag(frame.value1) == kind
                {
                    return match self.admit(link, topology, frame, room)? {
                        Confirm::Committed(address) => Ok(address),
                        Confirm::Declined => Err(JoinError::NotConfirmed),
                    };
                }
            }
            link.pause(self.listen.interval);
        }
        Err(JoinError::Timeout)
    }

    fn admit<R: Radio>(
        &mut self,
        link: &mut Link<R>,
        topology: &mut Topology,
        request: Frame,
        room: Option<RoomId>,
    ) -> Result<Confirm, JoinError> {
        let kind = DeviceKind::from_tag(request.value1);
        let nonce = request.value2;

        let target = match kind {
            DeviceKind::Thermostat => None,
            DeviceKind::Register => match room.or(self.designated) {
                Some(room) => Some(room),
                None => {
                    link.send(Address::SYNC, Command::RejectAddr, 0, nonce)?;
                    info!("rejected register join before any thermostat");
                    return Err(JoinError::NoRoom);
                }
            },
        };

        let Some(candidate) = self.allocator.candidate(kind, topology, link.own_address()) else {
            return Err(JoinError::DeviceLimit(topology.device_count()));
        };
        link.send(Address::SYNC, Command::SetAddr, i32::from(candidate.0), nonce)?;

        for _ in 0..self.join.attempts {
            if let Some(frame) = link.poll() {
                match frame.command {
                    Command::ReceivedAddr if frame.value2 == nonce => {
                        self.commit(topology, candidate, target)?;
                        return Ok(Confirm::Committed(candidate));
                    }
                    Command::AddrNotSet => {
                        debug!("{candidate} declined by a competing device");
                        return Ok(Confirm::Declined);
                    }
                    _ => {}
                }
            }
            link.pause(self.join.interval);
        }

        warn!("{kind} {candidate} never confirmed its address");
        Err(JoinError::Timeout)
    }

    fn commit(
        &mut self,
        topology: &mut Topology,
        address: Address,
        room: Option<RoomId>,
    ) -> Result<(), JoinError> {
        match room {
            None => {
                let room = topology.add_thermostat(address)?;
                self.designated = Some(room);
                info!("thermostat {address} joined as room {room}");
            }
            Some(room) => {
                topology.add_register(room, address)?;
                info!("register {address} joined room {room}");
            }
        }
        self.allocator.advance();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enrollment {
    pub address: Address,
    pub controller: Address,
}

/// Peripheral side: announce, wait for a `SET_ADDR` carrying our nonce, confirm.
/// A failed attempt leaves the previous address in place.
pub fn join_as_peripheral<R: Radio>(
    link: &mut Link<R>,
    kind: DeviceKind,
    nonce: i32,
    policy: RetryPolicy,
) -> Result<Enrollment, JoinError> {
    let previous = link.own_address();
    link.set_own_address(Address::BROADCAST);
    link.set_accept_sync(true);
    let result = announce_and_wait(link, kind, nonce, policy);
    link.set_accept_sync(false);

    match &result {
        Ok(enrollment) => {
            link.set_own_address(enrollment.address);
            info!(
                "joined as {} under controller {}",
                enrollment.address, enrollment.controller
            );
        }
        Err(err) => {
            link.set_own_address(previous);
            debug!("{kind} join failed: {err}");
        }
    }
    result
}

fn announce_and_wait<R: Radio>(
    link: &mut Link<R>,
    kind: DeviceKind,
    nonce: i32,
    policy: RetryPolicy,
) -> Result<Enrollment, JoinError> {
    link.send(Address::SYNC, Command::CreateAddr, i32::from(kind.tag()), nonce)?;

    for _ in 0..policy.attempts {
        if let Some(frame) = link.poll() {
            match frame.command {
                Command::SetAddr if DeviceKind::from_tag(frame.value1) == kind => {
                    if frame.value2 == nonce {
                        let address = Address(frame.value1 as u8);
                        link.send(frame.source, Command::ReceivedAddr, frame.value1, nonce)?;
                        return Ok(Enrollment {
                            address,
                            controller: frame.source,
                        });
                    }
                    link.send(frame.source, Command::AddrNotSet, 0, 0)?;
                }
                Command::RejectAddr if kind == DeviceKind::Register => {
                    return Err(JoinError::Rejected);
                }
                _ => {}
            }
        }
        link.pause(policy.interval);
    }
    Err(JoinError::Timeout)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::radio::ScriptedRadio;

    const NONCE: i32 = 0x1234;

    fn controller_link(radio: &ScriptedRadio) -> Link<ScriptedRadio> {
        Link::new(radio.clone(), Address::BROADCAST, &ProtocolConfig::default()).with_seed(3)
    }

    /// A peer that confirms any address offered with its nonce.
    fn confirming_peer() -> ScriptedRadio {
        ScriptedRadio::with_responder(|frame| match frame.command {
            Command::SetAddr => vec![Frame::new(
                frame.source,
                Address(frame.value1 as u8),
                Command::ReceivedAddr,
                frame.value1,
                frame.value2,
            )],
            _ => Vec::new(),
        })
    }

    fn create(kind: DeviceKind, nonce: i32) -> Frame {
        Frame::new(
            Address::SYNC,
            Address::BROADCAST,
            Command::CreateAddr,
            i32::from(kind.tag()),
            nonce,
        )
    }

    #[test]
    fn allocator_wraps_within_seven_bits_and_skips_taken() {
        let mut topology = Topology::new();
        topology.add_thermostat(Address(0x80 | 126)).unwrap();
        let mut allocator = AddressAllocator::new(126);

        assert_eq!(
            allocator.candidate(DeviceKind::Thermostat, &topology, Address(0x05)),
            Some(Address(0x81))
        );
        allocator.advance();
        assert_eq!(allocator.peek(), 2);
        assert_eq!(AddressAllocator::new(0).peek(), 1);
    }

    #[test]
    fn allocator_never_offers_the_controller_address() {
        let topology = Topology::new();
        let own = Address(0x05);
        let mut allocator = AddressAllocator::new(own.0);

        assert_eq!(
            allocator.candidate(DeviceKind::Thermostat, &topology, own),
            Some(Address(0x85))
        );
        assert_eq!(
            allocator.candidate(DeviceKind::Register, &topology, own),
            Some(Address(0x06))
        );
    }

    #[test]
    fn register_joined_right_after_session_start_skips_controller_address() {
        let radio = confirming_peer();
        let mut link = controller_link(&radio);
        let mut joiner = Joiner::new(&ProtocolConfig::default());
        let mut topology = Topology::new();
        let local = joiner.begin_session(&mut link);
        let room = topology.add_thermostat(Address(0xF0)).unwrap();

        radio.push_incoming(create(DeviceKind::Register, NONCE));
        let register = joiner
            .join_one(&mut link, &mut topology, DeviceKind::Register, Some(room), &Held)
            .unwrap();

        assert_ne!(register, local);
        assert_eq!(register, Address(local.0 + 1));
    }

    #[test]
    fn thermostat_then_register_share_a_room() {
        let radio = confirming_peer();
        let mut link = controller_link(&radio);
        let mut joiner = Joiner::new(&ProtocolConfig::default());
        let mut topology = Topology::new();
        let local = joiner.begin_session(&mut link);

        radio.push_incoming(create(DeviceKind::Thermostat, NONCE));
        let thermostat = joiner
            .join_one(&mut link, &mut topology, DeviceKind::Thermostat, None, &Held)
            .unwrap();
        radio.push_incoming(create(DeviceKind::Register, NONCE + 1));
        let register = joiner
            .join_one(&mut link, &mut topology, DeviceKind::Register, None, &Held)
            .unwrap();

        assert_eq!(thermostat, Address(0x80 | local.0));
        assert_eq!(register, Address(local.0 + 1));
        assert_eq!(topology.room_count(), 1);
        assert_eq!(topology.register_count(RoomId(1)), Ok(1));
        assert_eq!(
            radio.sent()[0],
            Frame::new(Address::SYNC, local, Command::SetAddr, i32::from(thermostat.0), NONCE)
        );
    }

    #[test]
    fn register_before_thermostat_is_rejected() {
        let radio = confirming_peer();
        let mut link = controller_link(&radio);
        let mut joiner = Joiner::new(&ProtocolConfig::default());
        let mut topology = Topology::new();
        radio.push_incoming(create(DeviceKind::Register, NONCE));
        let sync = AtomicBool::new(true);

        let report = joiner.run_session(&mut link, &mut topology, &sync);

        assert!(report.joined.is_empty());
        assert_eq!(
            radio.sent(),
            vec![Frame::new(Address::SYNC, report.local, Command::RejectAddr, 0, NONCE)]
        );
        assert!(topology.is_empty());
    }

    #[test]
    fn declined_candidate_is_not_committed() {
        let radio = ScriptedRadio::with_responder(|frame| match frame.command {
            Command::SetAddr => vec![Frame::new(frame.source, Address::BROADCAST, Command::AddrNotSet, 0, 0)],
            _ => Vec::new(),
        });
        let mut link = controller_link(&radio);
        let mut joiner = Joiner::new(&ProtocolConfig::default());
        let mut topology = Topology::new();
        radio.push_incoming(create(DeviceKind::Thermostat, NONCE));

        let err = joiner
            .join_one(&mut link, &mut topology, DeviceKind::Thermostat, None, &Held)
            .unwrap_err();

        assert!(matches!(err, JoinError::NotConfirmed));
        assert!(topology.is_empty());
    }

    #[test]
    fn session_ends_when_sync_is_released() {
        let radio = ScriptedRadio::new();
        let mut link = controller_link(&radio);
        let mut joiner = Joiner::new(&ProtocolConfig::default());
        let mut topology = Topology::new();
        let sync = AtomicBool::new(false);

        let report = joiner.run_session(&mut link, &mut topology, &sync);

        assert!(report.joined.is_empty());
        assert_eq!(radio.pauses(), 0);
    }

    fn reply(to: &Frame, command: Command) -> Frame {
        Frame::new(to.source, Address(to.value1 as u8), command, to.value1, to.value2)
    }

    #[test]
    fn session_commits_several_devices_until_the_cap() {
        // nonce 2 loses its candidate to a competing device once; nonce 5 is
        // still waiting when the cap is reached
        let radio = ScriptedRadio::with_responder(|frame| {
            if frame.command != Command::SetAddr {
                return Vec::new();
            }
            match frame.value2 {
                1 => vec![
                    reply(frame, Command::ReceivedAddr),
                    create(DeviceKind::Register, 2),
                ],
                2 => vec![
                    Frame::new(frame.source, Address::BROADCAST, Command::AddrNotSet, 0, 0),
                    create(DeviceKind::Register, 3),
                ],
                3 => vec![
                    reply(frame, Command::ReceivedAddr),
                    create(DeviceKind::Thermostat, 4),
                ],
                4 => vec![
                    reply(frame, Command::ReceivedAddr),
                    create(DeviceKind::Thermostat, 5),
                ],
                _ => Vec::new(),
            }
        });
        let config = ProtocolConfig {
            max_devices: 3,
            ..ProtocolConfig::default()
        };
        let mut link = Link::new(radio.clone(), Address::BROADCAST, &config).with_seed(3);
        let mut joiner = Joiner::new(&config);
        let mut topology = Topology::new();
        radio.push_incoming(create(DeviceKind::Thermostat, 1));

        let report = joiner.run_session(&mut link, &mut topology, &Held);

        let local = report.local.0;
        assert_eq!(
            report.joined,
            vec![
                Address(0x80 | local),
                Address(local + 1),
                Address(0x80 | (local + 2))
            ]
        );
        assert_eq!(topology.room_count(), 2);
        assert_eq!(topology.register_count(RoomId(1)), Ok(1));
        assert_eq!(topology.register_count(RoomId(2)), Ok(0));
        assert_eq!(radio.pending(), 1);
        assert!(!radio
            .sent()
            .iter()
            .any(|frame| frame.command == Command::SetAddr && frame.value2 == 5));
    }

    #[test]
    fn session_keeps_listening_after_an_unconfirmed_offer() {
        let stray = Frame::new(Address(0x42), Address(0x43), Command::Ack, 0, 0);
        let radio = ScriptedRadio::with_responder(move |frame| match (frame.command, frame.value2) {
            // the first device never confirms; traffic meant for others fills
            // the confirm window before a second device announces
            (Command::SetAddr, 1) => vec![stray, stray, stray, create(DeviceKind::Thermostat, 2)],
            (Command::SetAddr, _) => vec![reply(frame, Command::ReceivedAddr)],
            _ => Vec::new(),
        });
        let config = ProtocolConfig {
            join_attempts: 3,
            listen_attempts: 5,
            ..ProtocolConfig::default()
        };
        let mut link = Link::new(radio.clone(), Address::BROADCAST, &config).with_seed(3);
        let mut joiner = Joiner::new(&config);
        let mut topology = Topology::new();
        radio.push_incoming(create(DeviceKind::Thermostat, 1));

        let report = joiner.run_session(&mut link, &mut topology, &Held);

        assert_eq!(report.joined, vec![Address(0x80 | report.local.0)]);
        assert_eq!(topology.room_count(), 1);
        let offers: Vec<i32> = radio
            .sent()
            .iter()
            .filter(|frame| frame.command == Command::SetAddr)
            .map(|frame| frame.value2)
            .collect();
        assert_eq!(offers, vec![1, 2]);
    }

    #[test]
    fn register_join_needs_an_existing_room() {
        let radio = ScriptedRadio::new();
        let mut link = controller_link(&radio);
        let mut joiner = Joiner::new(&ProtocolConfig::default());
        let mut topology = Topology::new();

        let err = joiner
            .join_one(&mut link, &mut topology, DeviceKind::Register, Some(RoomId(2)), &Held)
            .unwrap_err();

        assert!(matches!(err, JoinError::Topology(_)));
    }

    #[test]
    fn peripheral_accepts_its_own_nonce() {
        let radio = ScriptedRadio::with_responder(|frame| match frame.command {
            Command::CreateAddr => vec![Frame::new(
                Address::SYNC,
                Address(0x07),
                Command::SetAddr,
                0x85,
                frame.value2,
            )],
            _ => Vec::new(),
        });
        let mut link = Link::new(radio.clone(), Address::BROADCAST, &ProtocolConfig::default());
        let policy = ProtocolConfig::default().join_policy();

        let enrollment = join_as_peripheral(&mut link, DeviceKind::Thermostat, NONCE, policy).unwrap();

        assert_eq!(
            enrollment,
            Enrollment {
                address: Address(0x85),
                controller: Address(0x07)
            }
        );
        assert_eq!(link.own_address(), Address(0x85));
        assert_eq!(
            radio.sent().last(),
            Some(&Frame::new(Address(0x07), Address::BROADCAST, Command::ReceivedAddr, 0x85, NONCE))
        );
    }

    #[test]
    fn peripheral_refuses_a_foreign_nonce() {
        let radio = ScriptedRadio::new();
        radio.push_incoming(Frame::new(Address::SYNC, Address(0x07), Command::SetAddr, 0x85, NONCE + 1));
        let mut link = Link::new(radio.clone(), Address::BROADCAST, &ProtocolConfig::default());
        let policy = RetryPolicy::new(5, std::time::Duration::ZERO);

        let err = join_as_peripheral(&mut link, DeviceKind::Thermostat, NONCE, policy).unwrap_err();

        assert!(matches!(err, JoinError::Timeout));
        assert_eq!(link.own_address(), Address::BROADCAST);
        assert_eq!(
            radio.sent().last(),
            Some(&Frame::new(Address(0x07), Address::BROADCAST, Command::AddrNotSet, 0, 0))
        );
    }

    #[test]
    fn register_peripheral_aborts_on_reject() {
        let radio = ScriptedRadio::new();
        radio.push_incoming(Frame::new(Address::SYNC, Address(0x07), Command::RejectAddr, 0, NONCE));
        let mut link = Link::new(radio, Address::BROADCAST, &ProtocolConfig::default());
        let policy = ProtocolConfig::default().join_policy();

        let err = join_as_peripheral(&mut link, DeviceKind::Register, NONCE, policy).unwrap_err();

        assert!(matches!(err, JoinError::Rejected));
    }
}
