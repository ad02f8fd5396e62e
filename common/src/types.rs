use serde::{Deserialize, Serialize};

use crate::{frame::Address, topology::RoomId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HvacMode {
    Auto,
    Cool,
    Heat,
    Fan,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Cool => "COOL",
            Self::Heat => "HEAT",
            Self::Fan => "FAN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "AUTO" => Some(Self::Auto),
            "COOL" | "COOLING" => Some(Self::Cool),
            "HEAT" | "HEATING" => Some(Self::Heat),
            "FAN" | "FAN_ONLY" => Some(Self::Fan),
            _ => None,
        }
    }
}

/// Direction auto mode settled on from the rooms' votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoResolution {
    Heating,
    Cooling,
    Stalemate,
}

impl AutoResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heating => "HEATING",
            Self::Cooling => "COOLING",
            Self::Stalemate => "STALEMATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    Idle,
    Active,
}

impl ControlState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Active => "ACTIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlantOutput {
    pub fan: bool,
    pub heat: bool,
    pub cool: bool,
}

impl PlantOutput {
    pub const OFF: Self = Self {
        fan: false,
        heat: false,
        cool: false,
    };

    pub fn heating() -> Self {
        Self {
            fan: true,
            heat: true,
            cool: false,
        }
    }

    pub fn cooling() -> Self {
        Self {
            fan: true,
            heat: false,
            cool: true,
        }
    }

    pub fn fan_only() -> Self {
        Self {
            fan: true,
            heat: false,
            cool: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room: RoomId,
    pub thermostat: Address,
    pub register_count: usize,
    pub registers: Vec<Address>,
    pub current_temp: Option<i32>,
    pub set_temp: Option<i32>,
    pub humidity: Option<i32>,
    pub difference: i32,
    pub flow_decile: u8,
    pub timer_running: bool,
    pub in_error: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub mode: &'static str,
    pub resolution: &'static str,
    pub state: &'static str,
    pub relays: PlantOutput,
    pub local_address: Address,
    pub room_count: usize,
    pub device_count: usize,
    pub error_count: usize,
    pub warning_active: bool,
    pub paused: bool,
    pub sync_active: bool,
    pub wall_clock: String,
    pub rooms: Vec<RoomSummary>,
}
