use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Bits in one transmitted reading: four data bytes plus the checksum.
pub const PAYLOAD_BITS: u8 = 40;

const PAYLOAD_MASK: u64 = (1 << PAYLOAD_BITS) - 1;

/// 40-bit shift register. New bits enter at bit 0 and move towards bit 39,
/// so after a full reading the first transmitted bit is the MSB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShiftBuffer(u64);

impl ShiftBuffer {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn push(self, bit: bool) -> Self {
        Self(((self.0 << 1) | u64::from(bit)) & PAYLOAD_MASK)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn frame(&self) -> Frame {
        Frame::from_bits(self.0)
    }
}

/// Modulo-256 sum of the four data bytes.
pub fn checksum(fields: [u8; 4]) -> u8 {
    fields.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// One reading as it appears on the wire, and as latched on the outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Frame {
    pub first_integral: u8,
    pub first_fractional: u8,
    pub second_integral: u8,
    pub second_fractional: u8,
    pub checksum: u8,
}

impl Frame {
    pub fn new(fields: [u8; 4], checksum: u8) -> Self {
        let [first_integral, first_fractional, second_integral, second_fractional] = fields;
        Self {
            first_integral,
            first_fractional,
            second_integral,
            second_fractional,
            checksum,
        }
    }

    /// A frame whose checksum field matches its data.
    pub fn with_checksum(fields: [u8; 4]) -> Self {
        Self::new(fields, checksum(fields))
    }

    pub fn from_bits(bits: u64) -> Self {
        let byte = |shift: u32| ((bits >> shift) & 0xff) as u8;
        Self {
            first_integral: byte(32),
            first_fractional: byte(24),
            second_integral: byte(16),
            second_fractional: byte(8),
            checksum: byte(0),
        }
    }

    pub fn to_bits(&self) -> u64 {
        self.bytes()
            .iter()
            .fold(0u64, |bits, byte| (bits << 8) | u64::from(*byte))
    }

    pub fn fields(&self) -> [u8; 4] {
        [
            self.first_integral,
            self.first_fractional,
            self.second_integral,
            self.second_fractional,
        ]
    }

    /// Bytes in transmission order, checksum last.
    pub fn bytes(&self) -> [u8; 5] {
        let [a, b, c, d] = self.fields();
        [a, b, c, d, self.checksum]
    }

    /// The `index`-th transmitted bit, MSB of the first byte first.
    pub fn bit(&self, index: u8) -> bool {
        debug_assert!(index < PAYLOAD_BITS);
        (self.to_bits() >> (PAYLOAD_BITS - 1 - index)) & 1 == 1
    }

    pub fn is_valid(&self) -> bool {
        checksum(self.fields()) == self.checksum
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, sum] = self.bytes();
        write!(f, "{a:02x} {b:02x} {c:02x} {d:02x} {sum:02x}")
    }
}

/// One hex byte, with or without a `0x` prefix.
pub fn parse_hex_byte(token: &str) -> Option<u8> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u8::from_str_radix(digits, 16).ok()
}

/// Accepts hex bytes separated by spaces, commas or colons, with optional
/// `0x` prefixes. Four bytes get a computed checksum; five are taken as is.
impl FromStr for Frame {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let bytes = input
            .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
            .filter(|token| !token.is_empty())
            .map(|token| {
                parse_hex_byte(token)
                    .ok_or_else(|| Error::invalid_frame(input, format!("`{token}` is not a hex byte")))
            })
            .collect::<Result<Vec<u8>>>()?;

        match bytes.as_slice() {
            &[a, b, c, d] => Ok(Frame::with_checksum([a, b, c, d])),
            &[a, b, c, d, sum] => Ok(Frame::new([a, b, c, d], sum)),
            other => Err(Error::invalid_frame(
                input,
                format!("expected 4 or 5 bytes, found {}", other.len()),
            )),
        }
    }
}

impl TryFrom<String> for Frame {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Frame> for String {
    fn from(frame: Frame) -> Self {
        frame.to_string()
    }
}
