use std::fmt::{self, Write as _};

use serde::Serialize;

use crate::{
    error::TopologyError,
    frame::{Address, DeviceKind},
    health::LinkHealth,
    rate::RateTable,
    types::RoomSummary,
};

/// 1-based room position. Position 0 is never a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomId(pub usize);

impl RoomId {
    fn index(self) -> Option<usize> {
        self.0.checked_sub(1)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reading {
    pub current: i32,
    pub set: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TemperatureRecord {
    /// `None` while the thermostat is unreachable or reports nonsense.
    pub reading: Option<Reading>,
    /// Signed distance to set-point in the direction the plant is driving.
    pub difference: i32,
    /// `difference` when the room's timer started.
    pub baseline: i32,
    pub humidity: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterSlot {
    pub address: Address,
    pub health: LinkHealth,
    /// Last opening the register reported about itself. Telemetry only.
    pub reported_flow: Option<i32>,
}

impl RegisterSlot {
    fn new(address: Address) -> Self {
        Self {
            address,
            health: LinkHealth::default(),
            reported_flow: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Room {
    pub thermostat: Address,
    pub health: LinkHealth,
    pub temperature: TemperatureRecord,
    /// Commanded opening decile, applied to every register in the room.
    pub flow: u8,
    pub rates: RateTable,
    pub timer: Option<u64>,
    pub registers: Vec<RegisterSlot>,
}

impl Room {
    fn new(thermostat: Address) -> Self {
        Self {
            thermostat,
            health: LinkHealth::default(),
            temperature: TemperatureRecord::default(),
            flow: 0,
            rates: RateTable::default(),
            timer: None,
            registers: Vec::new(),
        }
    }

    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    pub fn reading(&self) -> Option<Reading> {
        self.temperature.reading
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Thermostat(RoomId),
    Register(RoomId, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removed {
    /// The room is gone; `moved` names the former last room that now occupies it.
    Room { room: RoomId, moved: Option<RoomId> },
    Register { room: RoomId, slot: usize },
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    rooms: Vec<Room>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn device_count(&self) -> usize {
        self.rooms.iter().map(|room| 1 + room.registers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
    }

    pub fn contains(&self, address: Address) -> bool {
        self.locate(address).is_some()
    }

    pub fn locate(&self, address: Address) -> Option<Location> {
        self.iter().find_map(|(id, room)| {
            if room.thermostat == address {
                return Some(Location::Thermostat(id));
            }
            room.registers
                .iter()
                .position(|slot| slot.address == address)
                .map(|slot| Location::Register(id, slot))
        })
    }

    pub fn room(&self, id: RoomId) -> Result<&Room, TopologyError> {
        id.index()
            .and_then(|index| self.rooms.get(index))
            .ok_or(TopologyError::UnknownRoom(id))
    }

    pub fn room_mut(&mut self, id: RoomId) -> Result<&mut Room, TopologyError> {
        id.index()
            .and_then(|index| self.rooms.get_mut(index))
            .ok_or(TopologyError::UnknownRoom(id))
    }

    pub fn register_count(&self, id: RoomId) -> Result<usize, TopologyError> {
        self.room(id).map(Room::register_count)
    }

    pub fn rooms(&self) -> impl Iterator<Item = RoomId> + Clone {
        (1..=self.rooms.len()).map(RoomId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RoomId, &Room)> {
        self.rooms
            .iter()
            .enumerate()
            .map(|(index, room)| (RoomId(index + 1), room))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RoomId, &mut Room)> {
        self.rooms
            .iter_mut()
            .enumerate()
            .map(|(index, room)| (RoomId(index + 1), room))
    }

    pub fn add_thermostat(&mut self, address: Address) -> Result<RoomId, TopologyError> {
        self.check_new(address, DeviceKind::Thermostat)?;
        self.rooms.push(Room::new(address));
        Ok(RoomId(self.rooms.len()))
    }

    pub fn add_register(&mut self, id: RoomId, address: Address) -> Result<(), TopologyError> {
        self.check_new(address, DeviceKind::Register)?;
        self.room_mut(id)?.registers.push(RegisterSlot::new(address));
        Ok(())
    }

    /// Removing a thermostat drops its room and moves the last room into the gap.
    /// Removing a register shifts later registers of that room down by one.
    pub fn remove_device(&mut self, address: Address) -> Result<Removed, TopologyError> {
        match self.locate(address) {
            Some(Location::Thermostat(room)) => {
                let index = room.index().ok_or(TopologyError::UnknownRoom(room))?;
                let last = RoomId(self.rooms.len());
                self.rooms.swap_remove(index);
                let moved = (last != room).then_some(last);
                Ok(Removed::Room { room, moved })
            }
            Some(Location::Register(room, slot)) => {
                self.room_mut(room)?.registers.remove(slot);
                Ok(Removed::Register { room, slot })
            }
            None => Err(TopologyError::UnknownAddress(address)),
        }
    }

    pub fn sticky_count(&self) -> usize {
        self.rooms
            .iter()
            .map(|room| {
                usize::from(room.health.is_sticky())
                    + room
                        .registers
                        .iter()
                        .filter(|slot| slot.health.is_sticky())
                        .count()
            })
            .sum()
    }

    pub fn summaries(&self) -> Vec<RoomSummary> {
        self.iter()
            .map(|(id, room)| RoomSummary {
                room: id,
                thermostat: room.thermostat,
                register_count: room.registers.len(),
                registers: room.registers.iter().map(|slot| slot.address).collect(),
                current_temp: room.reading().map(|reading| reading.current),
                set_temp: room.reading().map(|reading| reading.set),
                humidity: room.temperature.humidity,
                difference: room.temperature.difference,
                flow_decile: room.flow,
                timer_running: room.timer.is_some(),
                in_error: room.health.is_sticky()
                    || room.registers.iter().any(|slot| slot.health.is_sticky()),
            })
            .collect()
    }

    pub fn dump(&self) -> String {
        let mut out = format!("rooms={}", self.rooms.len());
        for (id, room) in self.iter() {
            let _ = write!(out, "\n  [{id}] {} ({})", room.thermostat, room.registers.len());
            for slot in &room.registers {
                let _ = write!(out, " {}", slot.address);
            }
        }
        out
    }

    fn check_new(&self, address: Address, kind: DeviceKind) -> Result<(), TopologyError> {
        if address.is_reserved() {
            return Err(TopologyError::Reserved(address));
        }
        if address.kind() != kind {
            return Err(TopologyError::WrongKind(address, kind));
        }
        if self.contains(address) {
            return Err(TopologyError::Duplicate(address));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn three_rooms() -> Topology {
        let mut topology = Topology::new();
        for (thermostat, registers) in [(0x81, [0x02, 0x03]), (0x84, [0x05, 0x06]), (0x87, [0x08, 0x09])] {
            let room = topology.add_thermostat(Address(thermostat)).unwrap();
            for register in registers {
                topology.add_register(room, Address(register)).unwrap();
            }
        }
        topology
    }

    fn assert_counts_consistent(topology: &Topology) {
        for (id, room) in topology.iter() {
            assert_eq!(topology.register_count(id).unwrap(), room.registers.len());
        }
    }

    #[test]
    fn thermostat_opens_rooms_in_order() {
        let topology = three_rooms();

        assert_eq!(topology.room_count(), 3);
        assert_eq!(topology.device_count(), 9);
        assert_eq!(topology.rooms().collect::<Vec<_>>(), vec![RoomId(1), RoomId(2), RoomId(3)]);
        assert_eq!(topology.locate(Address(0x06)), Some(Location::Register(RoomId(2), 1)));
        assert_counts_consistent(&topology);
    }

    #[test]
    fn removing_a_middle_room_moves_the_last_room_whole() {
        let mut topology = three_rooms();
        {
            let last = topology.room_mut(RoomId(3)).unwrap();
            last.flow = 7;
            last.timer = Some(42);
            last.rates.record(10, 1.0);
            last.health.record_failure();
        }
        let snapshot = topology.room(RoomId(3)).unwrap().clone();

        let removed = topology.remove_device(Address(0x84)).unwrap();

        assert_eq!(
            removed,
            Removed::Room {
                room: RoomId(2),
                moved: Some(RoomId(3))
            }
        );
        assert_eq!(topology.room_count(), 2);
        assert_eq!(topology.room(RoomId(2)).unwrap(), &snapshot);
        assert!(topology.room(RoomId(3)).is_err());
        assert_counts_consistent(&topology);
    }

    #[test]
    fn removing_the_last_room_leaves_nothing_behind() {
        let mut topology = three_rooms();

        let removed = topology.remove_device(Address(0x87)).unwrap();

        assert_eq!(
            removed,
            Removed::Room {
                room: RoomId(3),
                moved: None
            }
        );
        assert_eq!(topology.room_count(), 2);
        assert_eq!(topology.device_count(), 6);
        assert!(!topology.contains(Address(0x08)));
    }

    #[test]
    fn removing_a_register_shifts_later_slots() {
        let mut topology = three_rooms();
        topology.add_register(RoomId(1), Address(0x0A)).unwrap();
        topology.room_mut(RoomId(1)).unwrap().registers[2].reported_flow = Some(30);

        topology.remove_device(Address(0x03)).unwrap();

        let room = topology.room(RoomId(1)).unwrap();
        assert_eq!(
            room.registers.iter().map(|slot| slot.address).collect::<Vec<_>>(),
            vec![Address(0x02), Address(0x0A)]
        );
        assert_eq!(room.registers[1].reported_flow, Some(30));
        assert_counts_consistent(&topology);
    }

    #[test]
    fn structural_errors_leave_rooms_untouched() {
        let mut topology = three_rooms();

        assert_eq!(
            topology.remove_device(Address(0x44)),
            Err(TopologyError::UnknownAddress(Address(0x44)))
        );
        assert_eq!(
            topology.add_register(RoomId(9), Address(0x44)),
            Err(TopologyError::UnknownRoom(RoomId(9)))
        );
        assert_eq!(
            topology.add_register(RoomId(1), Address(0x05)),
            Err(TopologyError::Duplicate(Address(0x05)))
        );
        assert_eq!(
            topology.add_thermostat(Address(0x05)),
            Err(TopologyError::WrongKind(Address(0x05), DeviceKind::Thermostat))
        );
        assert_eq!(
            topology.add_thermostat(Address::SYNC),
            Err(TopologyError::Reserved(Address::SYNC))
        );
        assert!(topology.room(RoomId(0)).is_err());
        assert_eq!(topology.device_count(), 9);
    }

    #[test]
    fn sticky_devices_are_tallied() {
        let mut topology = three_rooms();
        let room = topology.room_mut(RoomId(1)).unwrap();
        for _ in 0..5 {
            room.health.record_failure();
            room.registers[0].health.record_failure();
        }

        assert_eq!(topology.sticky_count(), 2);
        assert!(topology.summaries()[0].in_error);
        assert!(!topology.summaries()[1].in_error);
    }
}
