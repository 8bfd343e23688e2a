//! Cycle counts for every protocol window.
//!
//! The reference design runs from a 50 MHz clock. Any other clock rate gets
//! the same wall-clock windows by proportional rescaling.

use crate::{Error, Result};

/// Clock rate the reference constants are expressed in.
pub const REFERENCE_CLOCK_HZ: u32 = 50_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Host start pulse, line held LOW (18 ms).
    pub start_low: u32,
    /// Host drives HIGH before releasing the line (40 us).
    pub start_high: u32,
    /// Shortest LOW accepted as the start of a bit-cell (40 us).
    pub min_bit_low: u32,
    /// HIGH pulses strictly longer than this decode as 1 (48 us).
    pub one_threshold: u32,
}

impl Timing {
    pub const REFERENCE: Timing = Timing {
        start_low: 900_000,
        start_high: 2_000,
        min_bit_low: 2_000,
        one_threshold: 2_400,
    };

    pub fn for_clock(clock_hz: u32) -> Result<Self> {
        let scale = |window: &'static str, cycles: u32| -> Result<u32> {
            let scaled = u64::from(cycles) * u64::from(clock_hz) / u64::from(REFERENCE_CLOCK_HZ);
            match u32::try_from(scaled) {
                Ok(0) | Err(_) => Err(Error::ClockTooSlow { clock_hz, window }),
                Ok(value) => Ok(value),
            }
        };

        let reference = Self::REFERENCE;
        Ok(Timing {
            start_low: scale("start low", reference.start_low)?,
            start_high: scale("start high", reference.start_high)?,
            min_bit_low: scale("minimum bit low", reference.min_bit_low)?,
            one_threshold: scale("one threshold", reference.one_threshold)?,
        })
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::REFERENCE
    }
}

/// Number of whole clock cycles in `micros` microseconds.
pub fn cycles_for_micros(clock_hz: u32, micros: u32) -> u32 {
    let cycles = u64::from(micros) * u64::from(clock_hz) / 1_000_000;
    u32::try_from(cycles).unwrap_or(u32::MAX)
}
