use std::path::PathBuf;

use thiserror::Error;

use crate::controller::ProtocolState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A timing window rescaled to zero cycles at the requested clock rate.
    #[error("clock rate {clock_hz} Hz is too slow to resolve the {window} window")]
    ClockTooSlow { clock_hz: u32, window: &'static str },

    #[error("invalid frame `{input}`: {reason}")]
    InvalidFrame { input: String, reason: String },

    #[error("failed to read config file {path:?}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("VCD trace I/O failed")]
    Trace(#[from] std::io::Error),

    /// Harness watchdog: no Latch happened within the cycle budget.
    #[error("no reading completed within {cycles} cycles (controller in {state})")]
    Stalled { cycles: u64, state: ProtocolState },
}

impl Error {
    pub(crate) fn invalid_frame(input: &str, reason: impl Into<String>) -> Self {
        Self::InvalidFrame {
            input: input.to_owned(),
            reason: reason.into(),
        }
    }
}
