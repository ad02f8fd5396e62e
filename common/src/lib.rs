pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod health;
pub mod join;
pub mod pause;
pub mod peripheral;
pub mod protocol;
pub mod radio;
pub mod rate;
pub mod sensing;
pub mod topics;
pub mod topology;
pub mod transport;
pub mod types;
pub mod udp;

pub use clock::{Clock, ManualClock, SystemClock, WallClock};
pub use config::{ControlConfig, MqttConfig, ProtocolConfig, RadioConfig, RuntimeConfig};
pub use control::{ControlAction, ControlEngine};
pub use error::{FrameError, JoinError, LinkError, RadioError, TopologyError};
pub use frame::{Address, Command, DeviceKind, Frame};
pub use join::{join_as_peripheral, Enrollment, Held, Joiner, SessionReport, SyncControl};
pub use pause::{ExclusiveGuard, PauseToken, TickGuard};
pub use peripheral::{PeripheralNode, Role, Step};
pub use protocol::{Link, RetryPolicy};
pub use radio::{Radio, RadioMode, ScriptedRadio, SimulatedAir};
pub use topics::*;
pub use topology::{RoomId, Topology};
pub use types::{
    AutoResolution, ControlState, ControllerStatus, HvacMode, PlantOutput, RoomSummary,
};
pub use udp::UdpRadio;
