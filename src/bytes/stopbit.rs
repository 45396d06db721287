//! Stop-bit integer and compact floating point wire encodings.
//!
//! Stop-bit values are little-endian base-128: seven payload bits per
//! byte, 0x80 flagging continuation. Negative values are one's-complement
//! encoded with every group flagged, closed by a single 0x00 terminator,
//! so the wire carries the sign itself. The longest legal sequence is 10
//! bytes (`i64::MIN`); anything longer is corrupt.

use super::{Bytes, FloatMode, UnderflowMode};
use crate::error::{Error, Result};

const CONTINUE: u8 = 0x80;

/// Longest legal stop-bit sequence in bytes.
pub const MAX_STOP_BIT_LEN: usize = 10;

/// Compact-float markers: the value is exactly +0.0, a scaled stop-bit
/// i64 follows, an f32 literal follows, an f64 literal follows.
const FLOAT_ZERO: u8 = 0x00;
const FLOAT_SCALED: u8 = 0x01;
const FLOAT_F32: u8 = 0x02;
const FLOAT_F64: u8 = 0x03;

/// Fixed decimal scale of the compact form: value = n / 10^6.
const FLOAT_SCALE: f64 = 1e6;

/// Number of bytes [`Bytes::write_stop_bit`] emits for `value`.
pub fn stop_bit_len(value: i64) -> usize {
    let (mut magnitude, terminator) = if value < 0 {
        (!(value as u64), 1)
    } else {
        (value as u64, 0)
    };
    let mut groups = 1;
    while magnitude >= 0x80 {
        magnitude >>= 7;
        groups += 1;
    }
    groups + terminator
}

impl Bytes {
    /// Write a stop-bit encoded integer.
    ///
    /// The wire is always signed; unsigned callers cast, and values above
    /// `i64::MAX` round-trip through the cast unchanged.
    pub fn write_stop_bit(&mut self, value: i64) -> Result<()> {
        let negative = value < 0;
        let mut n = if negative {
            !(value as u64)
        } else {
            value as u64
        };
        loop {
            let group = (n & 0x7F) as u8;
            n >>= 7;
            let more = n != 0;
            if more || negative {
                self.write_u8(group | CONTINUE)?;
            } else {
                return self.write_u8(group);
            }
            if !more {
                // negative: all groups were flagged, close with the sign
                // terminator
                return self.write_u8(0);
            }
        }
    }

    /// Read a stop-bit encoded integer.
    pub fn read_stop_bit(&mut self) -> Result<i64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            // A value cut off after a continuation byte must not finish
            // decoding from mode-synthesized zeros; only `Padded` keeps
            // reading them.
            if shift > 0
                && self.underflow_mode() == UnderflowMode::ZeroExtend
                && self.remaining() == 0
            {
                return Err(Error::Underflow {
                    needed: 1,
                    remaining: 0,
                });
            }
            let byte = self.read_u8()?;
            if byte & CONTINUE == 0 {
                if byte == 0 && shift > 0 {
                    // sign terminator after flagged groups
                    return Ok(!value as i64);
                }
                // The tenth group carries bit 63 alone; anything above it
                // would shift out silently.
                if shift == 63 && byte > 1 {
                    return Err(Error::CorruptStream(format!(
                        "stop-bit final group {byte:#04x} overflows 64 bits"
                    )));
                }
                return Ok((value | ((byte as u64) << shift)) as i64);
            }
            value |= ((byte & 0x7F) as u64) << shift;
            shift += 7;
            if shift > 63 {
                return Err(Error::CorruptStream(
                    "stop-bit sequence longer than 10 bytes".to_string(),
                ));
            }
        }
    }

    /// Write `value` in the compact floating point form.
    ///
    /// One marker byte picks the representation: +0.0 collapses to the
    /// marker alone; values that survive a decimal-6 scaling under the
    /// active [`FloatMode`] become a stop-bit integer; values that
    /// survive an f32 round-trip become 4 bytes; everything else is a
    /// full f64 literal.
    pub fn write_compact_f64(&mut self, value: f64) -> Result<()> {
        if value.to_bits() == 0 {
            return self.write_u8(FLOAT_ZERO);
        }
        if let Some(scaled) = scaled_form(value, self.float_mode) {
            self.write_u8(FLOAT_SCALED)?;
            return self.write_stop_bit(scaled);
        }
        let narrowed = value as f32;
        if f64::from(narrowed).to_bits() == value.to_bits() {
            self.write_u8(FLOAT_F32)?;
            return self.write_f32(narrowed);
        }
        self.write_u8(FLOAT_F64)?;
        self.write_f64(value)
    }

    /// Read a value written by [`Bytes::write_compact_f64`].
    pub fn read_compact_f64(&mut self) -> Result<f64> {
        match self.read_u8()? {
            FLOAT_ZERO => Ok(0.0),
            FLOAT_SCALED => Ok(self.read_stop_bit()? as f64 / FLOAT_SCALE),
            FLOAT_F32 => Ok(f64::from(self.read_f32()?)),
            FLOAT_F64 => self.read_f64(),
            other => Err(Error::CorruptStream(format!(
                "unknown compact float marker {other:#04x}"
            ))),
        }
    }
}

/// The scaled i64 whose decode matches `value` under `mode`, if any.
fn scaled_form(value: f64, mode: FloatMode) -> Option<i64> {
    let scaled = value * FLOAT_SCALE;
    // stay well inside i64 so the cast below cannot saturate surprisingly
    if !scaled.is_finite() || scaled.abs() >= 9.0e18 {
        return None;
    }
    let n = scaled.round() as i64;
    let back = n as f64 / FLOAT_SCALE;
    let close_enough = match mode {
        FloatMode::Exact => back.to_bits() == value.to_bits(),
        FloatMode::Ulp => {
            ordered_bits(back)
                .wrapping_sub(ordered_bits(value))
                .unsigned_abs()
                <= 1
        }
        // n was produced by rounding value to 6 decimals, so decoding is
        // the same rounding by construction
        FloatMode::Decimal6 => true,
    };
    close_enough.then_some(n)
}

/// Map float bits so integer distance counts units in the last place
/// across the sign boundary.
fn ordered_bits(value: f64) -> i64 {
    let bits = value.to_bits() as i64;
    if bits < 0 {
        i64::MIN.wrapping_sub(bits)
    } else {
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::UnderflowMode;

    fn scratch() -> Bytes {
        Bytes::alloc_heap(256).unwrap()
    }

    #[test]
    fn test_small_values_take_one_byte() {
        let mut bytes = scratch();
        for value in [0i64, 1, 63, 127] {
            bytes.clear();
            bytes.write_stop_bit(value).unwrap();
            assert_eq!(bytes.position(), 1);
            assert_eq!(stop_bit_len(value), 1);
            bytes.flip();
            assert_eq!(bytes.read_stop_bit().unwrap(), value);
        }
    }

    #[test]
    fn test_known_encodings() {
        let mut bytes = scratch();
        bytes.write_stop_bit(300).unwrap();
        bytes.flip();
        // 300 = 0b10_0101100: low group 0x2C flagged, then 0x02
        assert_eq!(bytes.read_u8().unwrap(), 0xAC);
        assert_eq!(bytes.read_u8().unwrap(), 0x02);

        let mut bytes = scratch();
        bytes.write_stop_bit(-1).unwrap();
        bytes.flip();
        // ~(-1) = 0: one flagged zero group plus the sign terminator
        assert_eq!(bytes.read_u8().unwrap(), 0x80);
        assert_eq!(bytes.read_u8().unwrap(), 0x00);
    }

    #[test]
    fn test_extremes_round_trip_with_expected_lengths() {
        let cases = [
            (0i64, 1usize),
            (127, 1),
            (128, 2),
            (-1, 2),
            (i32::MAX as i64, 5),
            (i32::MIN as i64, 6),
            (i64::MAX, 9),
            (i64::MIN, 10),
        ];
        let mut bytes = scratch();
        for (value, expected_len) in cases {
            bytes.clear();
            bytes.write_stop_bit(value).unwrap();
            assert_eq!(bytes.position(), expected_len, "length of {value}");
            assert_eq!(stop_bit_len(value), expected_len, "stop_bit_len of {value}");
            bytes.flip();
            assert_eq!(bytes.read_stop_bit().unwrap(), value);
            assert_eq!(bytes.remaining(), 0);
        }
    }

    #[test]
    fn test_unsigned_casts_survive() {
        let mut bytes = scratch();
        let value = u64::MAX - 5;
        bytes.write_stop_bit(value as i64).unwrap();
        bytes.flip();
        assert_eq!(bytes.read_stop_bit().unwrap() as u64, value);
    }

    #[test]
    fn test_over_long_sequence_is_corrupt() {
        let mut bytes = scratch();
        for _ in 0..MAX_STOP_BIT_LEN {
            bytes.write_u8(0xFF).unwrap();
        }
        bytes.flip();
        assert!(matches!(
            bytes.read_stop_bit(),
            Err(Error::CorruptStream(_))
        ));
    }

    #[test]
    fn test_final_group_past_the_top_bit_is_corrupt() {
        // nine flagged zero groups put the tenth at shift 63, where only
        // bit 0 still fits
        let mut bytes = scratch();
        for _ in 0..9 {
            bytes.write_u8(0x80).unwrap();
        }
        bytes.write_u8(0x02).unwrap();
        bytes.flip();
        assert!(matches!(
            bytes.read_stop_bit(),
            Err(Error::CorruptStream(_))
        ));

        // bit 0 alone is the sign bit of the decoded value
        let mut bytes = scratch();
        for _ in 0..9 {
            bytes.write_u8(0x80).unwrap();
        }
        bytes.write_u8(0x01).unwrap();
        bytes.flip();
        assert_eq!(bytes.read_stop_bit().unwrap(), i64::MIN);
    }

    #[test]
    fn test_truncated_sequence_is_underflow() {
        let mut bytes = scratch();
        bytes.write_u8(0xAC).unwrap();
        bytes.flip();
        assert!(matches!(
            bytes.read_stop_bit(),
            Err(Error::Underflow { .. })
        ));
    }

    #[test]
    fn test_zero_extend_rejects_truncated_multi_byte_values() {
        // 0xAC opens the two-byte encoding of 300; a synthesized zero
        // would read as the sign terminator and decode -45 instead.
        let mut bytes = scratch().with_underflow_mode(UnderflowMode::ZeroExtend);
        bytes.write_u8(0xAC).unwrap();
        bytes.flip();
        assert!(matches!(
            bytes.read_stop_bit(),
            Err(Error::Underflow {
                needed: 1,
                remaining: 0
            })
        ));
    }

    #[test]
    fn test_padded_mode_completes_truncated_values_with_zeros() {
        let mut bytes = scratch().with_underflow_mode(UnderflowMode::Padded);
        bytes.write_u8(0xAC).unwrap();
        bytes.flip();
        // the padding byte 0x00 terminates the flagged group as a sign
        // marker: !44
        assert_eq!(bytes.read_stop_bit().unwrap(), -45);
    }

    #[test]
    fn test_compact_float_picks_the_small_forms() {
        let mut bytes = scratch();

        bytes.write_compact_f64(0.0).unwrap();
        assert_eq!(bytes.position(), 1);

        bytes.clear();
        // 2.5 scales to 2_500_000: marker + 4 stop-bit bytes
        bytes.write_compact_f64(2.5).unwrap();
        assert_eq!(bytes.position(), 5);
        bytes.flip();
        assert_eq!(bytes.read_compact_f64().unwrap(), 2.5);

        bytes.clear();
        bytes.write_compact_f64(-17.125).unwrap();
        bytes.flip();
        assert_eq!(bytes.read_compact_f64().unwrap(), -17.125);
    }

    #[test]
    fn test_compact_float_falls_back_to_literals() {
        let mut bytes = scratch();

        // f32-representable but not decimal-6 clean
        let narrow = f64::from(1.0f32 / 3.0f32);
        bytes.write_compact_f64(narrow).unwrap();
        assert_eq!(bytes.position(), 5);
        bytes.flip();
        assert_eq!(bytes.read_compact_f64().unwrap(), narrow);

        bytes.clear();
        let wide = std::f64::consts::PI;
        bytes.write_compact_f64(wide).unwrap();
        assert_eq!(bytes.position(), 9);
        bytes.flip();
        assert_eq!(bytes.read_compact_f64().unwrap(), wide);
    }

    #[test]
    fn test_decimal6_mode_is_lossy_but_stable() {
        let mut bytes = scratch().with_float_mode(FloatMode::Decimal6);
        bytes.write_compact_f64(std::f64::consts::PI).unwrap();
        bytes.flip();
        assert_eq!(bytes.read_compact_f64().unwrap(), 3.141593);
    }

    #[test]
    fn test_unknown_marker_is_corrupt() {
        let mut bytes = scratch();
        bytes.write_u8(0x17).unwrap();
        bytes.flip();
        assert!(matches!(
            bytes.read_compact_f64(),
            Err(Error::CorruptStream(_))
        ));
    }

    #[test]
    fn test_stop_bit_respects_underflow_mode() {
        let mut bytes = scratch().with_underflow_mode(UnderflowMode::ZeroExtend);
        bytes.flip();
        // nothing written: an empty read yields zero
        assert_eq!(bytes.read_stop_bit().unwrap(), 0);
    }
}
