//! airspy_tcp command encoding.
//!
//! Every command is five bytes: the command number from the parameter
//! table, then the value as a 32-bit big-endian integer in native units.
//!
//! ```text
//! +------+------+------+------+------+
//! | code |      value (big-endian)   |
//! +------+------+------+------+------+
//! ```

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use sdrlib_core::error::{Error, Result};
use sdrlib_core::units::ParamTable;

/// Length of one encoded command.
pub const COMMAND_LEN: usize = 5;

/// Length of the binary header `airspy_tcp` sends before its first reply.
pub const REPLY_HEADER_LEN: usize = 12;

/// Hardware sample rate. 6 MS/s is the only hardware rate that is an exact
/// multiple of 48 kHz.
pub const HARDWARE_RATE: u32 = 6_000_000;

/// Encode one command from its code and native value.
///
/// Values from `i32::MIN` to `u32::MAX` fit; negatives go out in two's
/// complement.
///
/// ```
/// use sdrlib_airspy::commands::encode_command;
///
/// let frame = encode_command(1, 166_376_000).unwrap();
/// assert_eq!(frame, &[0x01u8, 0x09, 0xEA, 0xB2, 0x40][..]);
/// ```
pub fn encode_command(code: u8, value: i64) -> Result<Bytes> {
    let word = if (0..=u32::MAX as i64).contains(&value) {
        value as u32
    } else if (i32::MIN as i64..0).contains(&value) {
        value as i32 as u32
    } else {
        return Err(Error::InvalidParameter(format!(
            "value {value} does not fit in 32 bits"
        )));
    };
    let mut buf = BytesMut::with_capacity(COMMAND_LEN);
    buf.put_u8(code);
    buf.put_u32(word);
    Ok(buf.freeze())
}

/// Encode a parameter given in natural units.
///
/// Unknown names fail with [`Error::UnknownParameter`].
pub fn encode_param(table: &ParamTable, name: &str, natural: f64) -> Result<Bytes> {
    let spec = table.lookup(name)?;
    let native = spec.unit.to_native(natural)?;
    encode_command(spec.code, native)
}

/// Split one frame back into code and raw value.
pub fn decode_command(frame: &[u8]) -> Option<(u8, u32)> {
    if frame.len() < COMMAND_LEN {
        return None;
    }
    let value = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
    Some((frame[0], value))
}

/// USB transfer buffer size for `buffered` worth of samples at
/// `hw_rate`, rounded up to a multiple of `alignment` bytes.
///
/// ```
/// use std::time::Duration;
/// use sdrlib_airspy::commands::usb_buffer_size;
///
/// assert_eq!(usb_buffer_size(6_000_000, Duration::from_millis(8), 512), 48_128);
/// ```
pub fn usb_buffer_size(hw_rate: u32, buffered: Duration, alignment: usize) -> usize {
    let raw = (hw_rate as u128 * buffered.as_nanos()).div_ceil(1_000_000_000) as usize;
    let alignment = alignment.max(1);
    raw.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_frame_worked_value() {
        let t = ParamTable::standard();
        let frame = encode_param(&t, "frequency", 166.376).unwrap();
        assert_eq!(frame[0], 1);
        assert_eq!(u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]), 166_376_000);
        assert_eq!(decode_command(&frame), Some((1, 166_376_000)));
    }

    #[test]
    fn flag_frames() {
        let t = ParamTable::standard();
        assert_eq!(encode_param(&t, "streaming", 1.0).unwrap(), &[15u8, 0, 0, 0, 1][..]);
        assert_eq!(encode_param(&t, "bias_tee", 0.0).unwrap(), &[11u8, 0, 0, 0, 0][..]);
    }

    #[test]
    fn gain_frame() {
        let t = ParamTable::standard();
        assert_eq!(encode_param(&t, "lna_gain", 10.0).unwrap(), &[3u8, 0, 0, 0, 10][..]);
    }

    #[test]
    fn unknown_parameter_never_encoded() {
        let t = ParamTable::standard();
        assert!(matches!(
            encode_param(&t, "tuner_gain", 10.5),
            Err(Error::UnknownParameter(_))
        ));
    }

    #[test]
    fn value_range() {
        assert_eq!(encode_command(2, u32::MAX as i64).unwrap(), &[2u8, 0xFF, 0xFF, 0xFF, 0xFF][..]);
        assert_eq!(encode_command(2, -1).unwrap(), &[2u8, 0xFF, 0xFF, 0xFF, 0xFF][..]);
        assert!(encode_command(2, 1 << 33).is_err());
        assert!(encode_command(2, i32::MIN as i64 - 1).is_err());
    }

    #[test]
    fn decode_short_frame() {
        assert_eq!(decode_command(&[1u8, 2, 3]), None);
    }

    #[test]
    fn buffer_rounds_up_to_alignment() {
        assert_eq!(usb_buffer_size(6_000_000, Duration::from_millis(8), 512), 48_128);
        assert_eq!(usb_buffer_size(64_000, Duration::from_millis(8), 512), 512);
        assert_eq!(usb_buffer_size(10_000_000, Duration::from_millis(8), 512), 80_384);
    }
}
