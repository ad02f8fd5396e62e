use tracing::{debug, info, warn};

use crate::{
    config::ControlConfig,
    rate::FULL_OPEN,
    sensing::compute_differences,
    topology::{RoomId, Topology},
    types::{AutoResolution, ControlState, HvacMode, PlantOutput},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Relays(PlantOutput),
    /// Room flow deciles changed and must be sent to the registers.
    PushFlows,
}

/// Idle/active scheduler that opens each room's registers so that all rooms in a
/// cycle reach their set-points together, learning per-room rates as they do.
#[derive(Debug, Clone)]
pub struct ControlEngine {
    config: ControlConfig,
    mode: HvacMode,
    resolution: AutoResolution,
    state: ControlState,
    relays: PlantOutput,
    warning: bool,
}

impl ControlEngine {
    pub fn new(mut config: ControlConfig, mode: HvacMode) -> Self {
        config.sanitize();
        Self {
            config,
            mode,
            resolution: AutoResolution::Stalemate,
            state: ControlState::Idle,
            relays: PlantOutput::OFF,
            warning: false,
        }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn mode(&self) -> HvacMode {
        self.mode
    }

    pub fn resolution(&self) -> AutoResolution {
        self.resolution
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn relays(&self) -> PlantOutput {
        self.relays
    }

    pub fn warning_active(&self) -> bool {
        self.warning
    }

    /// One control pass over fresh readings. `now_secs` is monotonic.
    pub fn tick(&mut self, topology: &mut Topology, now_secs: u64) -> Vec<ControlAction> {
        let mut actions = Vec::new();
        let report = compute_differences(
            topology,
            self.mode,
            self.resolution,
            self.config.comfort_band,
        );

        if report.warning != self.warning {
            if report.warning {
                warn!(
                    "{} of {} rooms disagree with {} mode",
                    report.mismatch_votes,
                    topology.room_count(),
                    self.mode.as_str()
                );
            } else {
                info!("mode mismatch warning cleared");
            }
            self.warning = report.warning;
        }

        let previous = self.resolution;
        if self.mode == HvacMode::Auto && report.direction != previous {
            info!(
                "auto resolved {} -> {}",
                previous.as_str(),
                report.direction.as_str()
            );
            self.resolution = report.direction;
        }

        if self.mode == HvacMode::Fan {
            self.drive(PlantOutput::fan_only(), &mut actions);
            return actions;
        }

        match self.state {
            ControlState::Idle => {
                if report.needs_run {
                    self.start_cycle(topology, report.direction, now_secs, &mut actions);
                }
            }
            ControlState::Active => {
                self.advance_cycle(topology, report.direction, now_secs, &mut actions);
            }
        }
        actions
    }

    /// Returns whether the mode changed. A change abandons any running cycle.
    pub fn set_mode_with_actions(
        &mut self,
        mode: HvacMode,
        topology: &mut Topology,
    ) -> (bool, Vec<ControlAction>) {
        if mode == self.mode {
            return (false, Vec::new());
        }
        info!("hvac mode {} -> {}", self.mode.as_str(), mode.as_str());
        self.mode = mode;
        (true, self.abandon_cycle(topology))
    }

    /// Stops every timer without learning, closes every room and switches the
    /// plant off.
    pub fn abandon_cycle(&mut self, topology: &mut Topology) -> Vec<ControlAction> {
        let mut actions = Vec::new();
        let mut flows_changed = false;
        for (_, room) in topology.iter_mut() {
            room.timer = None;
            if room.flow != 0 {
                room.flow = 0;
                flows_changed = true;
            }
        }
        if self.state == ControlState::Active {
            info!("cycle abandoned");
        }
        self.state = ControlState::Idle;
        self.drive(PlantOutput::OFF, &mut actions);
        if flows_changed {
            actions.push(ControlAction::PushFlows);
        }
        actions
    }

    fn start_cycle(
        &mut self,
        topology: &mut Topology,
        direction: AutoResolution,
        now_secs: u64,
        actions: &mut Vec<ControlAction>,
    ) {
        let band = self.config.comfort_band;
        let participates = |difference: i32, has_reading: bool| has_reading && difference > band;

        let slowest = topology
            .iter()
            .filter(|(_, room)| {
                participates(room.temperature.difference, room.reading().is_some())
            })
            .filter_map(|(id, room)| {
                room.rates
                    .projected_secs(FULL_OPEN, room.temperature.difference)
                    .map(|secs| (id, secs))
            })
            .fold(None, |best: Option<(RoomId, f32)>, (id, secs)| match best {
                Some((_, best_secs)) if best_secs >= secs => best,
                _ => Some((id, secs)),
            });

        let mut participants = 0;
        for (id, room) in topology.iter_mut() {
            let difference = room.temperature.difference;
            if !participates(difference, room.reading().is_some()) {
                room.flow = 0;
                room.timer = None;
                continue;
            }

            let decile = match slowest {
                Some((slowest_id, _)) if slowest_id == id => FULL_OPEN,
                Some((_, target)) if room.rates.get(FULL_OPEN).is_some() => room
                    .rates
                    .nearest_decile(difference, target)
                    .unwrap_or(FULL_OPEN),
                _ => FULL_OPEN,
            };
            room.flow = decile;
            room.timer = Some(now_secs);
            room.temperature.baseline = difference;
            participants += 1;
            debug!("room {id}: difference {difference}, decile {decile}");
        }

        if participants == 0 {
            return;
        }

        info!(
            "cycle started: {participants} rooms, {}",
            direction.as_str()
        );
        self.state = ControlState::Active;
        actions.push(ControlAction::PushFlows);
        self.drive(relays_for(direction), actions);
    }

    fn advance_cycle(
        &mut self,
        topology: &mut Topology,
        direction: AutoResolution,
        now_secs: u64,
        actions: &mut Vec<ControlAction>,
    ) {
        let band = self.config.comfort_band;
        let mut active = 0;
        let mut flows_changed = false;

        for (id, room) in topology.iter_mut() {
            if room.reading().is_none() {
                continue;
            }
            let difference = room.temperature.difference;
            match room.timer {
                Some(start) if difference <= 0 => {
                    let elapsed = now_secs.saturating_sub(start).max(1);
                    let rate = room.temperature.baseline as f32 * 60.0 / elapsed as f32;
                    if room.rates.record(room.flow, rate) {
                        info!(
                            "room {id}: reached set-point in {elapsed}s, {rate:.3} deg/min at decile {}",
                            room.flow
                        );
                    } else {
                        debug!("room {id}: rate {rate:.3} at decile {} discarded", room.flow);
                    }
                    room.flow = 0;
                    room.timer = None;
                    flows_changed = true;
                }
                Some(_) => active += 1,
                None if difference > band => {
                    info!("room {id}: joining running cycle fully open");
                    room.flow = FULL_OPEN;
                    room.timer = Some(now_secs);
                    room.temperature.baseline = difference;
                    flows_changed = true;
                    active += 1;
                }
                None => {}
            }
        }

        if active == 0 {
            for (_, room) in topology.iter_mut() {
                room.timer = None;
                if room.flow != 0 {
                    room.flow = 0;
                    flows_changed = true;
                }
            }
            info!("cycle complete");
            self.state = ControlState::Idle;
            self.drive(PlantOutput::OFF, actions);
        } else if self.mode == HvacMode::Auto {
            self.drive(relays_for(direction), actions);
        }

        if flows_changed {
            actions.push(ControlAction::PushFlows);
        }
    }

    fn drive(&mut self, output: PlantOutput, actions: &mut Vec<ControlAction>) {
        if output == self.relays {
            return;
        }
        info!(
            "relays fan={} heat={} cool={}",
            output.fan, output.heat, output.cool
        );
        self.relays = output;
        actions.push(ControlAction::Relays(output));
    }
}

fn relays_for(direction: AutoResolution) -> PlantOutput {
    match direction {
        AutoResolution::Heating => PlantOutput::heating(),
        AutoResolution::Cooling => PlantOutput::cooling(),
        AutoResolution::Stalemate => PlantOutput::fan_only(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{frame::Address, topology::Reading};

    fn engine(mode: HvacMode) -> ControlEngine {
        ControlEngine::new(ControlConfig::default(), mode)
    }

    fn topology_with(readings: &[(i32, i32)]) -> Topology {
        let mut topology = Topology::new();
        for (index, (current, set)) in readings.iter().enumerate() {
            let room = topology
                .add_thermostat(Address(0x81 + index as u8))
                .unwrap();
            set_reading(&mut topology, room, *current, *set);
        }
        topology
    }

    fn set_reading(topology: &mut Topology, room: RoomId, current: i32, set: i32) {
        topology.room_mut(room).unwrap().temperature.reading = Some(Reading { current, set });
    }

    fn flows(topology: &Topology) -> Vec<u8> {
        topology.iter().map(|(_, room)| room.flow).collect()
    }

    #[test]
    fn slower_room_opens_fully_and_faster_room_is_throttled() {
        // 4 degrees at 0.1/min is 40 minutes; 2 degrees at 0.1/min is 20 minutes.
        let mut topology = topology_with(&[(66, 70), (68, 70)]);
        for room in [RoomId(1), RoomId(2)] {
            topology.room_mut(room).unwrap().rates.record(10, 0.1);
        }
        let mut engine = engine(HvacMode::Heat);

        let actions = engine.tick(&mut topology, 100);

        assert_eq!(flows(&topology), vec![10, 5]);
        assert_eq!(
            actions,
            vec![
                ControlAction::PushFlows,
                ControlAction::Relays(PlantOutput::heating())
            ]
        );
        assert_eq!(engine.state(), ControlState::Active);
        let room = topology.room(RoomId(2)).unwrap();
        assert_eq!(room.timer, Some(100));
        assert_eq!(room.temperature.baseline, 2);
    }

    #[test]
    fn rooms_without_rates_open_fully() {
        let mut topology = topology_with(&[(66, 70), (68, 70), (70, 70)]);
        let mut engine = engine(HvacMode::Heat);

        engine.tick(&mut topology, 0);

        assert_eq!(flows(&topology), vec![10, 10, 0]);
        assert_eq!(topology.room(RoomId(3)).unwrap().timer, None);
    }

    #[test]
    fn reaching_set_point_learns_rate_and_ends_cycle() {
        let mut topology = topology_with(&[(66, 70)]);
        let mut engine = engine(HvacMode::Heat);
        engine.tick(&mut topology, 0);

        set_reading(&mut topology, RoomId(1), 68, 70);
        assert!(engine.tick(&mut topology, 600).is_empty());

        set_reading(&mut topology, RoomId(1), 70, 70);
        let actions = engine.tick(&mut topology, 1_200);

        // 4 degrees over 20 minutes at decile 10
        let room = topology.room(RoomId(1)).unwrap();
        assert_eq!(room.rates.get(10), Some(0.2));
        assert_eq!(room.rates.get(5), Some(0.1));
        assert_eq!(room.flow, 0);
        assert_eq!(room.timer, None);
        assert_eq!(engine.state(), ControlState::Idle);
        assert_eq!(
            actions,
            vec![
                ControlAction::Relays(PlantOutput::OFF),
                ControlAction::PushFlows
            ]
        );
    }

    #[test]
    fn late_room_joins_running_cycle() {
        let mut topology = topology_with(&[(66, 70), (70, 70)]);
        let mut engine = engine(HvacMode::Heat);
        engine.tick(&mut topology, 0);

        set_reading(&mut topology, RoomId(2), 67, 70);
        let actions = engine.tick(&mut topology, 30);

        let room = topology.room(RoomId(2)).unwrap();
        assert_eq!(room.flow, 10);
        assert_eq!(room.timer, Some(30));
        assert_eq!(room.temperature.baseline, 3);
        assert_eq!(actions, vec![ControlAction::PushFlows]);
    }

    #[test]
    fn unavailable_room_does_not_progress() {
        let mut topology = topology_with(&[(66, 70), (66, 70)]);
        let mut engine = engine(HvacMode::Heat);
        engine.tick(&mut topology, 0);

        topology.room_mut(RoomId(2)).unwrap().temperature.reading = None;
        set_reading(&mut topology, RoomId(1), 67, 70);
        engine.tick(&mut topology, 60);

        assert_eq!(topology.room(RoomId(2)).unwrap().timer, Some(0));
        assert!(topology.room(RoomId(2)).unwrap().rates.is_empty());
        assert_eq!(engine.state(), ControlState::Active);
    }

    #[test]
    fn auto_stalemate_runs_fan_only() {
        let mut topology = topology_with(&[(67, 70), (73, 70)]);
        let mut engine = engine(HvacMode::Auto);

        let actions = engine.tick(&mut topology, 0);

        assert_eq!(engine.resolution(), AutoResolution::Stalemate);
        assert!(actions.contains(&ControlAction::Relays(PlantOutput::fan_only())));
    }

    #[test]
    fn auto_redrives_relays_when_resolution_flips() {
        let mut topology = topology_with(&[(66, 70), (69, 70)]);
        let mut engine = engine(HvacMode::Auto);
        engine.tick(&mut topology, 0);
        assert_eq!(engine.relays(), PlantOutput::heating());

        // both rooms overshoot and now vote for cooling
        set_reading(&mut topology, RoomId(1), 74, 70);
        set_reading(&mut topology, RoomId(2), 75, 70);
        engine.tick(&mut topology, 60);

        assert_eq!(engine.resolution(), AutoResolution::Cooling);
        assert_eq!(engine.relays(), PlantOutput::cooling());
    }

    #[test]
    fn fan_mode_runs_fan_without_cycle() {
        let mut topology = topology_with(&[(60, 70)]);
        let mut engine = engine(HvacMode::Fan);

        let actions = engine.tick(&mut topology, 0);

        assert_eq!(actions, vec![ControlAction::Relays(PlantOutput::fan_only())]);
        assert_eq!(engine.state(), ControlState::Idle);
        assert_eq!(flows(&topology), vec![0]);
    }

    #[test]
    fn mode_change_abandons_cycle_without_learning() {
        let mut topology = topology_with(&[(66, 70)]);
        let mut engine = engine(HvacMode::Heat);
        engine.tick(&mut topology, 0);

        let (changed, actions) = engine.set_mode_with_actions(HvacMode::Cool, &mut topology);

        assert!(changed);
        assert_eq!(
            actions,
            vec![
                ControlAction::Relays(PlantOutput::OFF),
                ControlAction::PushFlows
            ]
        );
        let room = topology.room(RoomId(1)).unwrap();
        assert_eq!(room.timer, None);
        assert!(room.rates.is_empty());
        assert_eq!(engine.state(), ControlState::Idle);

        let (changed, actions) = engine.set_mode_with_actions(HvacMode::Cool, &mut topology);
        assert!(!changed);
        assert!(actions.is_empty());
    }
}
