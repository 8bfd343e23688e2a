//! The shared data wire.
//!
//! The host side is either driving an explicit level or released. The
//! peripheral side is open-drain: it can only pull the wire LOW. A pull-up
//! holds the wire HIGH when nobody pulls it down.

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Level {
    #[default]
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    pub fn is_low(self) -> bool {
        self == Level::Low
    }

    pub fn bit(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineMode {
    Driven,
    Released,
}

/// Host side of the wire as registered by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineDriver {
    mode: LineMode,
    level: Level,
}

impl LineDriver {
    pub const fn driven(level: Level) -> Self {
        Self {
            mode: LineMode::Driven,
            level,
        }
    }

    /// Release the wire. The output register keeps its last value but is no
    /// longer visible on the wire.
    pub const fn released(self) -> Self {
        Self {
            mode: LineMode::Released,
            level: self.level,
        }
    }

    pub fn mode(&self) -> LineMode {
        self.mode
    }

    /// Output register, regardless of whether it reaches the wire.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Level forced onto the wire, if any.
    pub fn output(&self) -> Option<Level> {
        match self.mode {
            LineMode::Driven => Some(self.level),
            LineMode::Released => None,
        }
    }
}

impl Default for LineDriver {
    fn default() -> Self {
        Self::driven(Level::Low)
    }
}

/// Resolves the wire level and watches for both sides fighting over it.
#[derive(Debug, Default)]
pub struct Bus {
    contentions: u64,
    contending: bool,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&mut self, host: LineDriver, peer_pulls_low: bool) -> Level {
        let contending = host.output() == Some(Level::High) && peer_pulls_low;
        if contending {
            self.contentions += 1;
            if !self.contending {
                warn!("bus contention: host drives HIGH while the peripheral pulls LOW");
            }
        }
        self.contending = contending;

        if peer_pulls_low {
            return Level::Low;
        }
        host.output().unwrap_or(Level::High)
    }

    /// Cycles during which the host drove HIGH against a LOW pull.
    pub fn contentions(&self) -> u64 {
        self.contentions
    }
}
