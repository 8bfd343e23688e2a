//! Peripheral side of the wire.
//!
//! [`Sensor`] answers every host start condition with the standard response
//! (acknowledge LOW/HIGH, 40 bit-cells, trailing LOW). [`Silent`] never
//! answers.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::line::Level;
use crate::reading::{Frame, PAYLOAD_BITS};
use crate::timing::cycles_for_micros;

/// Anything sharing the wire with the controller.
pub trait Peer {
    /// Whether this side pulls the wire LOW during the current cycle.
    fn pulls_low(&self) -> bool;

    /// Advance one clock cycle, having observed `level` on the wire.
    fn tick(&mut self, level: Level);
}

/// One segment of peripheral output, in clock cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    /// Pull the wire LOW.
    Low(u32),
    /// Let go of the wire.
    Release(u32),
}

impl Pulse {
    pub fn cycles(&self) -> u32 {
        match self {
            Pulse::Low(cycles) | Pulse::Release(cycles) => *cycles,
        }
    }
}

/// Peripheral timing in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorTiming {
    /// Shortest host LOW recognised as a start request.
    pub start_detect_us: u32,
    /// Delay from the host's rising edge to the acknowledge LOW.
    pub response_delay_us: u32,
    pub response_low_us: u32,
    pub response_high_us: u32,
    pub bit_low_us: u32,
    pub zero_high_us: u32,
    pub one_high_us: u32,
    pub end_low_us: u32,
}

impl Default for SensorTiming {
    fn default() -> Self {
        Self {
            start_detect_us: 500,
            response_delay_us: 60,
            response_low_us: 80,
            response_high_us: 80,
            bit_low_us: 50,
            zero_high_us: 26,
            one_high_us: 70,
            end_low_us: 50,
        }
    }
}

impl SensorTiming {
    pub fn widths(&self, clock_hz: u32) -> PulseWidths {
        let cycles = |micros| cycles_for_micros(clock_hz, micros);
        PulseWidths {
            start_detect: cycles(self.start_detect_us),
            response_delay: cycles(self.response_delay_us),
            response_low: cycles(self.response_low_us),
            response_high: cycles(self.response_high_us),
            bit_low: cycles(self.bit_low_us),
            zero_high: cycles(self.zero_high_us),
            one_high: cycles(self.one_high_us),
            end_low: cycles(self.end_low_us),
        }
    }
}

/// Peripheral timing in clock cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseWidths {
    pub start_detect: u32,
    pub response_delay: u32,
    pub response_low: u32,
    pub response_high: u32,
    pub bit_low: u32,
    pub zero_high: u32,
    pub one_high: u32,
    pub end_low: u32,
}

impl PulseWidths {
    /// The complete answer to one start condition.
    pub fn encode(&self, frame: &Frame) -> Vec<Pulse> {
        let mut pulses = Vec::with_capacity(4 + 2 * usize::from(PAYLOAD_BITS));
        pulses.push(Pulse::Release(self.response_delay));
        pulses.push(Pulse::Low(self.response_low));
        pulses.push(Pulse::Release(self.response_high));
        for index in 0..PAYLOAD_BITS {
            let high = if frame.bit(index) {
                self.one_high
            } else {
                self.zero_high
            };
            pulses.push(Pulse::Low(self.bit_low));
            pulses.push(Pulse::Release(high));
        }
        pulses.push(Pulse::Low(self.end_low));
        pulses
    }
}

/// What the sensor sends after a start condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Frame(Frame),
    /// A raw pulse script, played verbatim.
    Pulses(Vec<Pulse>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Listening { low_run: u32 },
    Playing { remaining: u32 },
}

/// Emulated DHT11-style peripheral.
pub struct Sensor {
    widths: PulseWidths,
    response: Response,
    phase: Phase,
    queue: VecDeque<Pulse>,
    pulling_low: bool,
    responses: u64,
}

impl Sensor {
    pub fn new(widths: PulseWidths, frame: Frame) -> Self {
        Self {
            widths,
            response: Response::Frame(frame),
            phase: Phase::Listening { low_run: 0 },
            queue: VecDeque::new(),
            pulling_low: false,
            responses: 0,
        }
    }

    pub fn set_frame(&mut self, frame: Frame) {
        self.response = Response::Frame(frame);
    }

    pub fn set_response(&mut self, response: Response) {
        self.response = response;
    }

    /// Start conditions answered so far.
    pub fn responses(&self) -> u64 {
        self.responses
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.phase, Phase::Listening { .. })
    }

    /// Play `pulses` right away, after anything already queued.
    pub fn inject(&mut self, pulses: impl IntoIterator<Item = Pulse>) {
        self.queue.extend(pulses);
        if self.is_listening() {
            self.advance();
        }
    }

    fn respond(&mut self) {
        let pulses = match &self.response {
            Response::Frame(frame) => {
                debug!(frame = %frame, "start condition detected, responding");
                self.widths.encode(frame)
            }
            Response::Pulses(pulses) => {
                debug!(pulses = pulses.len(), "start condition detected, playing script");
                pulses.clone()
            }
        };
        self.responses += 1;
        self.queue.extend(pulses);
        self.advance();
    }

    /// Load the next non-empty pulse, or go back to listening.
    fn advance(&mut self) {
        while let Some(pulse) = self.queue.pop_front() {
            if pulse.cycles() > 0 {
                self.pulling_low = matches!(pulse, Pulse::Low(_));
                self.phase = Phase::Playing {
                    remaining: pulse.cycles(),
                };
                return;
            }
        }
        trace!("response finished, listening");
        self.pulling_low = false;
        self.phase = Phase::Listening { low_run: 0 };
    }
}

impl Peer for Sensor {
    fn pulls_low(&self) -> bool {
        self.pulling_low
    }

    fn tick(&mut self, level: Level) {
        match self.phase {
            Phase::Playing { remaining } => {
                if remaining > 1 {
                    self.phase = Phase::Playing {
                        remaining: remaining - 1,
                    };
                } else {
                    self.advance();
                }
            }
            Phase::Listening { low_run } => {
                if level.is_low() {
                    self.phase = Phase::Listening {
                        low_run: low_run.saturating_add(1),
                    };
                } else if low_run >= self.widths.start_detect {
                    trace!(low_run, "host start pulse ended");
                    self.respond();
                } else {
                    self.phase = Phase::Listening { low_run: 0 };
                }
            }
        }
    }
}

/// A peripheral that is absent or dead.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Peer for Silent {
    fn pulls_low(&self) -> bool {
        false
    }

    fn tick(&mut self, _level: Level) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widths() -> PulseWidths {
        PulseWidths {
            start_detect: 5,
            response_delay: 2,
            response_low: 3,
            response_high: 3,
            bit_low: 2,
            zero_high: 1,
            one_high: 4,
            end_low: 2,
        }
    }

    /// Wire level as the sensor would see it with a released host.
    fn drive(sensor: &mut Sensor, host: Level, cycles: u32) -> Vec<bool> {
        (0..cycles)
            .map(|_| {
                let pulled = sensor.pulls_low();
                let level = if pulled { Level::Low } else { host };
                sensor.tick(level);
                pulled
            })
            .collect()
    }

    #[test]
    fn encodes_frame_msb_first() {
        let frame = Frame::from_bits(1 << 39);
        let pulses = widths().encode(&frame);
        assert_eq!(pulses.len(), 4 + 80);
        assert_eq!(pulses[3], Pulse::Low(2));
        assert_eq!(pulses[4], Pulse::Release(4));
        assert_eq!(pulses[6], Pulse::Release(1));
        assert_eq!(pulses.last(), Some(&Pulse::Low(2)));
    }

    #[test]
    fn short_host_low_is_not_a_start() {
        let mut sensor = Sensor::new(widths(), Frame::default());
        drive(&mut sensor, Level::Low, 4);
        let pulled = drive(&mut sensor, Level::High, 10);
        assert!(pulled.iter().all(|p| !p));
        assert_eq!(sensor.responses(), 0);
    }

    #[test]
    fn answers_after_start() {
        let mut sensor = Sensor::new(widths(), Frame::default());
        drive(&mut sensor, Level::Low, 5);
        let pulled = drive(&mut sensor, Level::High, 9);
        assert_eq!(sensor.responses(), 1);
        // rising edge, delay, acknowledge LOW, acknowledge HIGH
        assert_eq!(
            pulled,
            [false, false, false, true, true, true, false, false, false]
        );
    }

    #[test]
    fn injected_pulses_play_immediately() {
        let mut sensor = Sensor::new(widths(), Frame::default());
        sensor.inject([Pulse::Low(2)]);
        assert!(sensor.pulls_low());
        let pulled = drive(&mut sensor, Level::High, 3);
        assert_eq!(pulled, [true, true, false]);
        assert!(sensor.is_listening());
    }
}
