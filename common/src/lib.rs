pub mod command;
pub mod config;
pub mod pump;
pub mod tick;
pub mod topics;
pub mod types;

pub use command::{Command, DecodeError};
pub use config::{ControllerConfig, NetworkConfig, PersistedRecord, RecordError};
pub use pump::{PumpAction, PumpEngine};
pub use tick::TickFlag;
pub use topics::*;
pub use types::{Interval, OperatingMode};
