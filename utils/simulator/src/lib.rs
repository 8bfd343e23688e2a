mod config;
pub mod controller;
mod core;
mod error;
pub mod line;
mod monitor;
pub mod reading;
pub mod sensor;
pub mod timing;

// Re-export public API
pub use config::SimConfig;
pub use controller::{Controller, Inputs, ProtocolState, Registers};
pub use crate::core::{Attempt, Outcome, Simulator, Stats};
pub use error::{Error, Result};
pub use line::{Bus, Level, LineDriver, LineMode};
pub use monitor::{ObservedPulse, PulseMonitor};
pub use reading::{Frame, PAYLOAD_BITS, ShiftBuffer, checksum, parse_hex_byte};
pub use sensor::{Peer, Pulse, PulseWidths, Response, Sensor, SensorTiming, Silent};
pub use timing::{REFERENCE_CLOCK_HZ, Timing};
