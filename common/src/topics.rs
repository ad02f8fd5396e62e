pub const TOPIC_CONTROLLER_STATE: &str = "zonehvac/controller/state";
pub const TOPIC_CONTROLLER_ROOMS: &str = "zonehvac/controller/rooms";

/// Per-peripheral status topic, e.g. `zonehvac/peripheral/0x81/state`.
pub fn peripheral_state_topic(address: crate::frame::Address) -> String {
    format!("zonehvac/peripheral/{address}/state")
}
