//! Single-wire sensor protocol controller.
//!
//! Models the synchronous design one clock edge at a time. Every register is
//! held in [`Registers`]; a tick computes the complete next register set from
//! the current one and the sampled inputs, then commits it in one assignment,
//! so nothing written during a tick is visible to that same tick.
//!
//! Protocol phases, in order:
//!
//! | State        | Wire     | Leaves when                                   |
//! | ------------ | -------- | --------------------------------------------- |
//! | Idle         | LOW      | always                                        |
//! | StartLow     | LOW      | `start_low` cycles elapsed                    |
//! | StartHigh    | HIGH     | `start_high` cycles elapsed, wire released    |
//! | WaitRespLow  | released | peripheral lets the wire rise after a LOW     |
//! | WaitRespHigh | released | peripheral pulls LOW                          |
//! | BitLow       | released | wire rises after at least `min_bit_low`       |
//! | BitHigh      | released | wire falls; width decides the bit             |
//! | WaitLatch    | released | one cycle                                     |
//! | Latch        | released | one cycle; checksum checked, outputs latched  |
//! | WaitNext     | released | wire observed LOW                             |
//!
//! There is no timeout in the response or bit phases. A peripheral that
//! never answers leaves the controller waiting forever.

use std::fmt;

use tracing::{debug, trace};

use crate::line::{Level, LineDriver, LineMode};
use crate::reading::{Frame, PAYLOAD_BITS, ShiftBuffer};
use crate::timing::Timing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolState {
    #[default]
    Idle,
    StartLow,
    StartHigh,
    WaitRespLow,
    WaitRespHigh,
    BitLow,
    BitHigh,
    WaitLatch,
    Latch,
    WaitNext,
}

impl ProtocolState {
    pub const ALL: [ProtocolState; 10] = [
        ProtocolState::Idle,
        ProtocolState::StartLow,
        ProtocolState::StartHigh,
        ProtocolState::WaitRespLow,
        ProtocolState::WaitRespHigh,
        ProtocolState::BitLow,
        ProtocolState::BitHigh,
        ProtocolState::WaitLatch,
        ProtocolState::Latch,
        ProtocolState::WaitNext,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolState::Idle => "Idle",
            ProtocolState::StartLow => "StartLow",
            ProtocolState::StartHigh => "StartHigh",
            ProtocolState::WaitRespLow => "WaitRespLow",
            ProtocolState::WaitRespHigh => "WaitRespHigh",
            ProtocolState::BitLow => "BitLow",
            ProtocolState::BitHigh => "BitHigh",
            ProtocolState::WaitLatch => "WaitLatch",
            ProtocolState::Latch => "Latch",
            ProtocolState::WaitNext => "WaitNext",
        }
    }

    /// State register encoding, as dumped to waveforms.
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// States in which the host may hold the wire.
    pub fn host_drives(&self) -> bool {
        matches!(
            self,
            ProtocolState::Idle | ProtocolState::StartLow | ProtocolState::StartHigh
        )
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Boundary inputs sampled on the clock edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inputs {
    /// Active-low reset.
    pub reset_n: bool,
    /// Level seen on the wire.
    pub line: Level,
}

impl Inputs {
    pub fn running(line: Level) -> Self {
        Self {
            reset_n: true,
            line,
        }
    }

    pub fn in_reset(line: Level) -> Self {
        Self {
            reset_n: false,
            line,
        }
    }
}

/// Every register of the design. The power-on value is the reset value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    pub state: ProtocolState,
    pub line: LineDriver,
    /// Cycles since entering the state or since the last edge.
    pub counter: u32,
    /// Bits captured so far in the current reading.
    pub bit_index: u8,
    pub shift: ShiftBuffer,
    /// Last reading that passed its checksum.
    pub reading: Frame,
    /// High for the single cycle after a reading is latched.
    pub valid: bool,
}

pub struct Controller {
    timing: Timing,
    regs: Registers,
}

impl Controller {
    pub fn new(timing: Timing) -> Self {
        Self {
            timing,
            regs: Registers::default(),
        }
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn state(&self) -> ProtocolState {
        self.regs.state
    }

    pub fn line(&self) -> LineDriver {
        self.regs.line
    }

    pub fn reading(&self) -> Frame {
        self.regs.reading
    }

    pub fn valid(&self) -> bool {
        self.regs.valid
    }

    pub fn bit_index(&self) -> u8 {
        self.regs.bit_index
    }

    pub fn counter(&self) -> u32 {
        self.regs.counter
    }

    /// One rising clock edge.
    pub fn tick(&mut self, inputs: Inputs) {
        let next = if inputs.reset_n {
            self.next_registers(inputs.line)
        } else {
            Registers::default()
        };

        if next.state != self.regs.state {
            trace!(
                from = %self.regs.state,
                to = %next.state,
                counter = self.regs.counter,
                bit_index = self.regs.bit_index,
                "state transition"
            );
        }
        self.regs = next;
    }

    fn next_registers(&self, line: Level) -> Registers {
        let cur = &self.regs;
        let timing = &self.timing;
        let mut next = Registers {
            valid: false,
            ..*cur
        };
        let count = cur.counter.saturating_add(1);

        match cur.state {
            ProtocolState::Idle => {
                next.line = LineDriver::driven(Level::Low);
                next.counter = 1;
                next.state = ProtocolState::StartLow;
            }
            ProtocolState::StartLow => {
                if cur.counter < timing.start_low {
                    next.line = LineDriver::driven(Level::Low);
                    next.counter = count;
                } else {
                    next.line = LineDriver::driven(Level::High);
                    next.counter = 1;
                    next.state = ProtocolState::StartHigh;
                }
            }
            ProtocolState::StartHigh => {
                if cur.counter < timing.start_high {
                    next.line = LineDriver::driven(Level::High);
                    next.counter = count;
                } else {
                    next.line = cur.line.released();
                    next.counter = 0;
                    next.state = ProtocolState::WaitRespLow;
                }
            }
            ProtocolState::WaitRespLow => {
                if line.is_low() {
                    next.counter = count;
                } else if cur.counter > 0 {
                    next.counter = 1;
                    next.state = ProtocolState::WaitRespHigh;
                }
            }
            ProtocolState::WaitRespHigh => {
                if line.is_high() {
                    next.counter = count;
                } else {
                    next.counter = 0;
                    next.bit_index = 0;
                    next.shift = ShiftBuffer::new();
                    next.state = ProtocolState::BitLow;
                }
            }
            ProtocolState::BitLow => {
                if line.is_low() {
                    next.counter = count;
                } else if cur.counter >= timing.min_bit_low {
                    next.counter = 1;
                    next.state = ProtocolState::BitHigh;
                } else {
                    if cur.counter > 0 {
                        trace!(width = cur.counter, "short LOW ignored");
                    }
                    next.counter = 0;
                }
            }
            ProtocolState::BitHigh => {
                if line.is_high() {
                    next.counter = count;
                } else {
                    next.shift = cur.shift.push(cur.counter > timing.one_threshold);
                    next.bit_index = cur.bit_index + 1;
                    next.counter = 0;
                    next.state = if cur.bit_index == PAYLOAD_BITS - 1 {
                        ProtocolState::WaitLatch
                    } else {
                        ProtocolState::BitLow
                    };
                }
            }
            ProtocolState::WaitLatch => {
                next.state = ProtocolState::Latch;
            }
            ProtocolState::Latch => {
                let frame = cur.shift.frame();
                if frame.is_valid() {
                    debug!(reading = %frame, "reading latched");
                    next.reading = frame;
                    next.valid = true;
                } else {
                    debug!(reading = %frame, "checksum mismatch, reading discarded");
                }
                next.counter = 0;
                next.bit_index = 0;
                next.shift = ShiftBuffer::new();
                next.state = ProtocolState::WaitNext;
            }
            ProtocolState::WaitNext => {
                if line.is_low() {
                    next.state = ProtocolState::Idle;
                }
            }
        }

        debug_assert!(next.line.mode() == LineMode::Released || next.state.host_drives());
        next
    }
}
