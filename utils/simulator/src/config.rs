use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::reading::Frame;
use crate::sensor::SensorTiming;
use crate::timing::{REFERENCE_CLOCK_HZ, Timing};
use crate::{Error, Result};

/// Everything needed to set up a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Controller clock in Hz; every protocol window is rescaled to it.
    pub clock_hz: u32,
    /// Cycles reset is held before the controller is released.
    pub reset_cycles: u32,
    pub sensor: SensorTiming,
    /// Frame the emulated sensor transmits.
    pub frame: Frame,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            clock_hz: REFERENCE_CLOCK_HZ,
            reset_cycles: 5,
            sensor: SensorTiming::default(),
            frame: Frame::with_checksum([0x19, 0x00, 0x1a, 0x00]),
        }
    }
}

impl SimConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn timing(&self) -> Result<Timing> {
        Timing::for_clock(self.clock_hz)
    }
}
