use tracing::{debug, warn};

use crate::{
    config::ControlConfig,
    frame::Command,
    protocol::Link,
    radio::Radio,
    topology::{Reading, Topology},
    types::{AutoResolution, HvacMode},
};

/// Polls every thermostat for `(current, set)`. Unreachable thermostats and
/// readings outside the sane band leave the room without a reading and count
/// against the thermostat's health. Returns the number of rooms with a reading.
pub fn retrieve_temperatures<R: Radio>(
    link: &mut Link<R>,
    topology: &mut Topology,
    control: &ControlConfig,
) -> usize {
    let mut valid = 0;
    for (id, room) in topology.iter_mut() {
        let reading = match link.request(room.thermostat, Command::GetTemps, Command::ReturnTemps)
        {
            Ok(frame) if control.is_sane(frame.value1) && control.is_sane(frame.value2) => {
                Some(Reading {
                    current: frame.value1,
                    set: frame.value2,
                })
            }
            Ok(frame) => {
                debug!(
                    "room {id}: discarding reading {}/{} outside sane range",
                    frame.value1, frame.value2
                );
                None
            }
            Err(err) => {
                debug!("room {id}: {err}");
                None
            }
        };

        room.temperature.reading = reading;
        if room.health.record(reading.is_some()) {
            warn!("room {id}: thermostat {} is not responding", room.thermostat);
        }
        if reading.is_none() {
            continue;
        }
        valid += 1;

        if control.poll_humidity {
            match link.request(room.thermostat, Command::GetHum, Command::ReturnHum) {
                Ok(frame) => room.temperature.humidity = Some(frame.value1),
                Err(err) => debug!("room {id}: humidity unavailable: {err}"),
            }
        }
    }
    valid
}

/// Sends each room's commanded decile to all of its registers as `SET_FLOW(pct, pct)`.
pub fn push_register_flows<R: Radio>(link: &mut Link<R>, topology: &mut Topology) -> usize {
    let mut failed = 0;
    for (id, room) in topology.iter_mut() {
        let percent = i32::from(room.flow) * 10;
        for slot in room.registers.iter_mut() {
            let result = link.send_and_expect_ack(slot.address, Command::SetFlow, percent, percent);
            if let Err(err) = &result {
                debug!("room {id}: {err}");
                failed += 1;
            }
            if slot.health.record(result.is_ok()) {
                warn!("room {id}: register {} is not responding", slot.address);
            }
        }
    }
    failed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DifferenceReport {
    pub needs_run: bool,
    pub direction: AutoResolution,
    pub mismatch_votes: usize,
    pub warning: bool,
    pub valid_rooms: usize,
}

/// Restates every room's difference for `mode` and derives the run and warning
/// signals. `previous` is the auto resolution carried over when no room votes.
pub fn compute_differences(
    topology: &mut Topology,
    mode: HvacMode,
    previous: AutoResolution,
    band: i32,
) -> DifferenceReport {
    let room_count = topology.room_count();
    let mut report = DifferenceReport {
        needs_run: false,
        direction: previous,
        mismatch_votes: 0,
        warning: false,
        valid_rooms: 0,
    };

    match mode {
        HvacMode::Heat | HvacMode::Cool => {
            let heating = mode == HvacMode::Heat;
            report.direction = if heating {
                AutoResolution::Heating
            } else {
                AutoResolution::Cooling
            };
            for (_, room) in topology.iter_mut() {
                let Some(reading) = room.reading() else {
                    continue;
                };
                report.valid_rooms += 1;
                let difference = if heating {
                    reading.set - reading.current
                } else {
                    reading.current - reading.set
                };
                room.temperature.difference = difference;
                if difference > band {
                    report.needs_run = true;
                }
                if difference < -band {
                    report.mismatch_votes += 1;
                }
            }
        }
        HvacMode::Auto => {
            let (mut heat_votes, mut cool_votes, mut sum) = (0usize, 0usize, 0i64);
            for (_, room) in topology.iter() {
                let Some(reading) = room.reading() else {
                    continue;
                };
                report.valid_rooms += 1;
                let difference = reading.set - reading.current;
                if difference > band {
                    heat_votes += 1;
                    sum += i64::from(difference);
                } else if difference < -band {
                    cool_votes += 1;
                    sum += i64::from(difference);
                }
            }

            report.needs_run = heat_votes + cool_votes > 0;
            if report.needs_run {
                report.direction = if heat_votes != cool_votes {
                    if heat_votes > cool_votes {
                        AutoResolution::Heating
                    } else {
                        AutoResolution::Cooling
                    }
                } else if sum > 0 {
                    AutoResolution::Heating
                } else if sum < 0 {
                    AutoResolution::Cooling
                } else {
                    AutoResolution::Stalemate
                };
            }

            for (_, room) in topology.iter_mut() {
                let Some(reading) = room.reading() else {
                    continue;
                };
                room.temperature.difference = match report.direction {
                    AutoResolution::Heating => reading.set - reading.current,
                    AutoResolution::Cooling => reading.current - reading.set,
                    AutoResolution::Stalemate => (reading.set - reading.current).abs(),
                };
            }
        }
        HvacMode::Fan => {
            report.direction = AutoResolution::Stalemate;
            for (_, room) in topology.iter_mut() {
                let Some(reading) = room.reading() else {
                    continue;
                };
                report.valid_rooms += 1;
                room.temperature.difference = (reading.set - reading.current).abs();
            }
        }
    }

    report.warning = report.mismatch_votes * 2 > room_count;
    report
}
