use crate::line::Level;

/// A completed pulse seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedPulse {
    pub level: Level,
    /// Width in clock cycles.
    pub width: u64,
    /// Cycle on which the pulse began.
    pub start: u64,
}

/// Passive pulse-width decoder for the shared wire
///
/// Watches the resolved wire level once per clock cycle and reports every
/// pulse when the level changes. Independent of the controller, so it can be
/// used to check what actually happened on the wire.
pub struct PulseMonitor {
    level: Option<Level>,
    width: u64,
    start: u64,
    cycle: u64,
}

impl PulseMonitor {
    pub fn new() -> Self {
        Self {
            level: None,
            width: 0,
            start: 0,
            cycle: 0,
        }
    }

    /// Process one clock cycle of the wire.
    /// Returns the pulse that just ended, if the level changed.
    pub fn process(&mut self, level: Level) -> Option<ObservedPulse> {
        let cycle = self.cycle;
        self.cycle += 1;

        match self.level {
            Some(current) if current == level => {
                self.width += 1;
                None
            }
            Some(current) => {
                let finished = ObservedPulse {
                    level: current,
                    width: self.width,
                    start: self.start,
                };
                self.level = Some(level);
                self.width = 1;
                self.start = cycle;
                Some(finished)
            }
            None => {
                self.level = Some(level);
                self.width = 1;
                self.start = cycle;
                None
            }
        }
    }

    /// The pulse still in progress.
    pub fn current(&self) -> Option<ObservedPulse> {
        self.level.map(|level| ObservedPulse {
            level,
            width: self.width,
            start: self.start,
        })
    }
}

impl Default for PulseMonitor {
    fn default() -> Self {
        Self::new()
    }
}
