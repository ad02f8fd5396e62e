use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use crate::{
    error::RadioError,
    frame::{Frame, FRAME_LEN},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    Receive,
    Transmit,
}

pub trait Radio {
    fn set_mode(&mut self, mode: RadioMode);

    fn transmit(&mut self, frame: &[u8; FRAME_LEN]) -> Result<(), RadioError>;

    fn receive(&mut self) -> Option<Vec<u8>>;

    fn pause(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

struct Script {
    mode: RadioMode,
    inbox: VecDeque<Vec<u8>>,
    sent: Vec<Frame>,
    responder: Option<Responder>,
    fail_transmit: bool,
    pauses: u32,
}

#[derive(Clone)]
pub struct ScriptedRadio {
    script: Arc<Mutex<Script>>,
}

impl Default for ScriptedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRadio {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                mode: RadioMode::Receive,
                inbox: VecDeque::new(),
                sent: Vec::new(),
                responder: None,
                fail_transmit: false,
                pauses: 0,
            })),
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
    {
        let radio = Self::new();
        radio.set_responder(responder);
        radio
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
    {
        lock(&self.script).responder = Some(Box::new(responder));
    }

    pub fn push_incoming(&self, frame: Frame) {
        lock(&self.script).inbox.push_back(frame.encode().to_vec());
    }

    pub fn push_raw(&self, bytes: Vec<u8>) {
        lock(&self.script).inbox.push_back(bytes);
    }

    pub fn set_fail_transmit(&self, fail: bool) {
        lock(&self.script).fail_transmit = fail;
    }

    pub fn sent(&self) -> Vec<Frame> {
        lock(&self.script).sent.clone()
    }

    pub fn clear_sent(&self) {
        lock(&self.script).sent.clear();
    }

    pub fn mode(&self) -> RadioMode {
        lock(&self.script).mode
    }

    pub fn pauses(&self) -> u32 {
        lock(&self.script).pauses
    }

    pub fn pending(&self) -> usize {
        lock(&self.script).inbox.len()
    }
}

impl Radio for ScriptedRadio {
    fn set_mode(&mut self, mode: RadioMode) {
        lock(&self.script).mode = mode;
    }

    fn transmit(&mut self, bytes: &[u8; FRAME_LEN]) -> Result<(), RadioError> {
        let mut script = lock(&self.script);
        if script.fail_transmit {
            return Err(RadioError::NotAcknowledged);
        }
        let Ok(frame) = Frame::decode(bytes) else {
            return Ok(());
        };
        script.sent.push(frame);

        let replies = match script.responder.as_mut() {
            Some(responder) => responder(&frame),
            None => Vec::new(),
        };
        for reply in replies {
            script.inbox.push_back(reply.encode().to_vec());
        }
        Ok(())
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        let mut script = lock(&self.script);
        if script.mode != RadioMode::Receive {
            return None;
        }
        script.inbox.pop_front()
    }

    fn pause(&mut self, _duration: Duration) {
        lock(&self.script).pauses += 1;
    }
}

struct Station {
    mode: RadioMode,
    inbox: VecDeque<Vec<u8>>,
}

/// Shared medium for [`AirRadio`]s. A frame reaches every other station that is
/// listening at the moment it is sent; stations in transmit mode miss it.
#[derive(Clone, Default)]
pub struct SimulatedAir {
    stations: Arc<Mutex<Vec<Station>>>,
}

impl SimulatedAir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn radio(&self) -> AirRadio {
        let mut stations = lock(&self.stations);
        stations.push(Station {
            mode: RadioMode::Receive,
            inbox: VecDeque::new(),
        });
        AirRadio {
            air: self.clone(),
            station: stations.len() - 1,
        }
    }
}

pub struct AirRadio {
    air: SimulatedAir,
    station: usize,
}

impl Radio for AirRadio {
    fn set_mode(&mut self, mode: RadioMode) {
        if let Some(station) = lock(&self.air.stations).get_mut(self.station) {
            station.mode = mode;
        }
    }

    fn transmit(&mut self, frame: &[u8; FRAME_LEN]) -> Result<(), RadioError> {
        let mut stations = lock(&self.air.stations);
        for (index, station) in stations.iter_mut().enumerate() {
            if index != self.station && station.mode == RadioMode::Receive {
                station.inbox.push_back(frame.to_vec());
            }
        }
        Ok(())
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        let mut stations = lock(&self.air.stations);
        let station = stations.get_mut(self.station)?;
        if station.mode != RadioMode::Receive {
            return None;
        }
        station.inbox.pop_front()
    }
}
