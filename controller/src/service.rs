use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use zonehvac_common::{
    clock::Clock,
    sensing::{push_register_flows, retrieve_temperatures},
    topology::{Location, Removed},
    Address, Command, ControlAction, ControlEngine, ControllerStatus, DeviceKind, HvacMode,
    JoinError, Joiner, Link, LinkError, Radio, RoomId, RoomSummary, RuntimeConfig, SessionReport,
    SyncControl, Topology, TopologyError, WallClock,
};

use crate::relays::RelayBank;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("invalid time of day {0:02}:{1:02}")]
    InvalidTime(u32, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JoinedDevice {
    pub address: Address,
    pub room: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub valid_rooms: usize,
    pub register_failures: usize,
    pub actions: Vec<ControlAction>,
}

/// The master controller: one owner for the radio, the topology, the control
/// engine and the relays.
pub struct Controller<R, C, B> {
    link: Link<R>,
    clock: C,
    relays: B,
    topology: Topology,
    engine: ControlEngine,
    joiner: Joiner,
}

impl<R: Radio, C: Clock, B: RelayBank> Controller<R, C, B> {
    pub fn new(link: Link<R>, clock: C, relays: B, config: &RuntimeConfig) -> Self {
        Self {
            link,
            clock,
            relays,
            topology: Topology::new(),
            engine: ControlEngine::new(config.control.clone(), config.mode),
            joiner: Joiner::new(&config.protocol),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Retrieval, difference pass, control step and register push. Registers hear
    /// their flow every cycle, changed or not.
    pub fn tick(&mut self) -> CycleReport {
        let valid_rooms =
            retrieve_temperatures(&mut self.link, &mut self.topology, self.engine.config());
        let now = self.clock.now_secs();
        let actions = self.engine.tick(&mut self.topology, now);
        let mut register_failures = self.execute(&actions);
        if !actions.contains(&ControlAction::PushFlows) {
            register_failures = push_register_flows(&mut self.link, &mut self.topology);
        }

        CycleReport {
            valid_rooms,
            register_failures,
            actions,
        }
    }

    fn execute(&mut self, actions: &[ControlAction]) -> usize {
        let mut failures = 0;
        for action in actions {
            debug!("control action: {action:?}");
            match action {
                ControlAction::Relays(output) => {
                    if let Err(err) = self.relays.apply(*output) {
                        warn!("relay update failed: {err:#}");
                    }
                }
                ControlAction::PushFlows => {
                    failures += push_register_flows(&mut self.link, &mut self.topology);
                }
            }
        }
        failures
    }

    /// Rebuilds the topology from scratch with whatever devices join while
    /// `sync` is held.
    pub fn run_sync_session<S: SyncControl>(&mut self, sync: &S) -> SessionReport {
        let actions = self.engine.abandon_cycle(&mut self.topology);
        self.execute(&actions);
        self.topology.clear();

        let report = self
            .joiner
            .run_session(&mut self.link, &mut self.topology, sync);
        debug!("topology after sync: {}", self.topology.dump());
        report
    }

    /// Thermostats open a room; registers go into the most recently opened one.
    pub fn join_one_device<S: SyncControl>(
        &mut self,
        kind: DeviceKind,
        sync: &S,
    ) -> Result<JoinedDevice, ServiceError> {
        let address = self
            .joiner
            .join_one(&mut self.link, &mut self.topology, kind, None, sync)?;
        self.joined(address)
    }

    pub fn add_register_to_room<S: SyncControl>(
        &mut self,
        room: RoomId,
        sync: &S,
    ) -> Result<JoinedDevice, ServiceError> {
        let address = self.joiner.join_one(
            &mut self.link,
            &mut self.topology,
            DeviceKind::Register,
            Some(room),
            sync,
        )?;
        self.joined(address)
    }

    fn joined(&self, address: Address) -> Result<JoinedDevice, ServiceError> {
        let room = match self.topology.locate(address) {
            Some(Location::Thermostat(room)) | Some(Location::Register(room, _)) => room,
            None => return Err(TopologyError::UnknownAddress(address).into()),
        };
        Ok(JoinedDevice { address, room })
    }

    pub fn remove_device(&mut self, address: Address) -> Result<Removed, ServiceError> {
        let removed = self.topology.remove_device(address)?;
        match removed {
            Removed::Room { room, moved } => {
                self.joiner.room_removed(room, moved);
                info!("removed thermostat {address} and room {room}");
            }
            Removed::Register { room, .. } => info!("removed register {address} from room {room}"),
        }
        Ok(removed)
    }

    pub fn list_rooms(&self) -> Vec<RoomSummary> {
        self.topology.summaries()
    }

    pub fn error_count(&self) -> usize {
        self.topology.sticky_count()
    }

    pub fn warning_active(&self) -> bool {
        self.engine.warning_active()
    }

    pub fn set_mode(&mut self, mode: HvacMode) -> bool {
        let (changed, actions) = self.engine.set_mode_with_actions(mode, &mut self.topology);
        self.execute(&actions);
        changed
    }

    pub fn set_wall_clock(&mut self, hour: u32, minute: u32) -> Result<WallClock, ServiceError> {
        if !self.clock.set_wall_clock(hour, minute) {
            return Err(ServiceError::InvalidTime(hour, minute));
        }
        Ok(self.clock.wall_clock())
    }

    /// Asks a register for the opening it reports and records it as telemetry.
    pub fn read_register_flow(&mut self, address: Address) -> Result<i32, ServiceError> {
        let (room, slot) = match self.topology.locate(address) {
            Some(Location::Register(room, slot)) => (room, slot),
            Some(Location::Thermostat(_)) => {
                return Err(TopologyError::WrongKind(address, DeviceKind::Register).into())
            }
            None => return Err(TopologyError::UnknownAddress(address).into()),
        };

        let result = self
            .link
            .request(address, Command::GetFlow, Command::ReturnFlow);
        let slot = &mut self.topology.room_mut(room)?.registers[slot];
        if slot.health.record(result.is_ok()) {
            warn!("room {room}: register {address} is not responding");
        }
        let flow = result?.value1;
        slot.reported_flow = Some(flow);
        Ok(flow)
    }

    pub fn status(&self, paused: bool, sync_active: bool) -> ControllerStatus {
        ControllerStatus {
            mode: self.engine.mode().as_str(),
            resolution: self.engine.resolution().as_str(),
            state: self.engine.state().as_str(),
            relays: self.engine.relays(),
            local_address: self.link.own_address(),
            room_count: self.topology.room_count(),
            device_count: self.topology.device_count(),
            error_count: self.error_count(),
            warning_active: self.warning_active(),
            paused,
            sync_active,
            wall_clock: self.clock.wall_clock().to_string(),
            rooms: self.list_rooms(),
        }
    }
}
