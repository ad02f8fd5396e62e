use std::{net::Ipv4Addr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{protocol::RetryPolicy, types::HvacMode};

/// Radio timing. The retry counts and intervals are tuned protocol timing;
/// the defaults are what deployed peripherals expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub join_attempts: u32,
    pub join_interval_ms: u64,
    pub ack_attempts: u32,
    pub ack_interval_ms: u64,
    pub reply_attempts: u32,
    pub reply_interval_ms: u64,
    /// How long a join listens for `CREATE_ADDR` before giving up.
    pub listen_attempts: u32,
    pub max_devices: usize,
    /// Peripherals rejoin after this much radio silence while sync is held.
    pub resync_idle_ms: u64,
    pub peripheral_poll_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            join_attempts: 250,
            join_interval_ms: 18,
            ack_attempts: 50,
            ack_interval_ms: 18,
            reply_attempts: 10,
            reply_interval_ms: 10,
            listen_attempts: 3_000,
            max_devices: 126,
            resync_idle_ms: 3_000,
            peripheral_poll_ms: 2,
        }
    }
}

impl ProtocolConfig {
    pub fn sanitize(&mut self) {
        self.join_attempts = self.join_attempts.max(1);
        self.ack_attempts = self.ack_attempts.max(1);
        self.reply_attempts = self.reply_attempts.max(1);
        self.listen_attempts = self.listen_attempts.max(1);
        self.max_devices = self.max_devices.clamp(1, 126);
        self.peripheral_poll_ms = self.peripheral_poll_ms.clamp(1, 100);
    }

    pub fn join_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.join_attempts, Duration::from_millis(self.join_interval_ms))
    }

    pub fn ack_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.ack_attempts, Duration::from_millis(self.ack_interval_ms))
    }

    pub fn reply_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.reply_attempts,
            Duration::from_millis(self.reply_interval_ms),
        )
    }

    pub fn listen_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.listen_attempts,
            Duration::from_millis(self.join_interval_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub cycle_interval_ms: u64,
    /// Degrees a room may drift from its set-point before it asks for the plant.
    pub comfort_band: i32,
    pub min_valid_temp: i32,
    pub max_valid_temp: i32,
    pub poll_humidity: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 1_500,
            comfort_band: 1,
            min_valid_temp: -150,
            max_valid_temp: 150,
            poll_humidity: false,
        }
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        self.cycle_interval_ms = self.cycle_interval_ms.clamp(250, 60_000);
        self.comfort_band = self.comfort_band.clamp(0, 10);
        if self.min_valid_temp >= self.max_valid_temp {
            let defaults = Self::default();
            self.min_valid_temp = defaults.min_valid_temp;
            self.max_valid_temp = defaults.max_valid_temp;
        }
    }

    /// Bounds are exclusive.
    pub fn is_sane(&self, temp: i32) -> bool {
        temp > self.min_valid_temp && temp < self.max_valid_temp
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RadioConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub interface: Ipv4Addr,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 42, 99),
            port: 42_424,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MqttConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub protocol: ProtocolConfig,
    pub control: ControlConfig,
    pub radio: RadioConfig,
    pub mqtt: MqttConfig,
    /// Mode restored at boot; changed through the API.
    pub mode: HvacMode,
    pub timezone: String,
    pub http_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            control: ControlConfig::default(),
            radio: RadioConfig::default(),
            mqtt: MqttConfig {
                port: 1883,
                ..MqttConfig::default()
            },
            mode: HvacMode::Auto,
            timezone: "America/Los_Angeles".to_string(),
            http_port: 8080,
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.protocol.sanitize();
        self.control.sanitize();
        if self.mqtt.port == 0 {
            self.mqtt.port = 1883;
        }
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            self.timezone = Self::default().timezone;
        }
    }
}
