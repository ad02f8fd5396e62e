use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Instant,
};

use chrono::{Duration, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WallClock {
    pub hour: u32,
    pub minute: u32,
    pub is_pm: bool,
}

impl WallClock {
    pub fn from_time(time: NaiveTime) -> Self {
        let (is_pm, hour) = time.hour12();
        Self {
            hour,
            minute: time.minute(),
            is_pm,
        }
    }
}

impl fmt::Display for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.is_pm { "PM" } else { "AM" };
        write!(f, "{}:{:02} {suffix}", self.hour, self.minute)
    }
}

pub trait Clock: Send {
    fn now_secs(&self) -> u64;

    fn elapsed_secs_since(&self, reference: u64) -> u64 {
        self.now_secs().saturating_sub(reference)
    }

    fn wall_clock(&self) -> WallClock;

    /// Sets the displayed time of day (24-hour input). Returns false when the
    /// time is invalid.
    fn set_wall_clock(&mut self, hour: u32, minute: u32) -> bool;
}

/// Monotonic time from [`Instant`]; wall time from the system clock in the
/// configured timezone, shifted by whatever offset the user has set.
pub struct SystemClock {
    origin: Instant,
    timezone: Tz,
    offset: Duration,
}

impl SystemClock {
    pub fn new(timezone: Tz) -> Self {
        Self {
            origin: Instant::now(),
            timezone,
            offset: Duration::zero(),
        }
    }

    fn local_now(&self) -> chrono::NaiveDateTime {
        Utc::now().with_timezone(&self.timezone).naive_local()
    }
}

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }

    fn wall_clock(&self) -> WallClock {
        WallClock::from_time((self.local_now() + self.offset).time())
    }

    fn set_wall_clock(&mut self, hour: u32, minute: u32) -> bool {
        let local = self.local_now();
        let Some(target) = local.date().and_hms_opt(hour, minute, 0) else {
            return false;
        };
        self.offset = target - local;
        true
    }
}

struct ManualState {
    secs: u64,
    time: NaiveTime,
}

/// Clock driven by hand, for tests and replays. Clones share state.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                secs: 0,
                time: NaiveTime::default(),
            })),
        }
    }

    pub fn advance(&self, secs: u64) {
        let mut state = self.lock();
        state.secs += secs;
        state.time += Duration::seconds(secs as i64);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.lock().secs
    }

    fn wall_clock(&self) -> WallClock {
        WallClock::from_time(self.lock().time)
    }

    fn set_wall_clock(&mut self, hour: u32, minute: u32) -> bool {
        match NaiveTime::from_hms_opt(hour, minute, 0) {
            Some(time) => {
                self.lock().time = time;
                true
            }
            None => false,
        }
    }
}
