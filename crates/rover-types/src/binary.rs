//! Little-endian field helpers for attribute payloads.

use bytes::{Buf, BufMut};

use crate::error::{ParseError, ParseResult};

fn check_width(data: &[u8], width: usize) -> ParseResult<()> {
    if data.len() % width != 0 {
        return Err(ParseError::FieldWidth {
            width,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Encode `values` as consecutive little-endian `u16`s.
#[must_use]
pub fn u16s_to_bytes(values: &[u16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 2);
    for value in values {
        buf.put_u16_le(*value);
    }
    buf
}

/// Encode `values` as consecutive little-endian `i16`s.
#[must_use]
pub fn i16s_to_bytes(values: &[i16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 2);
    for value in values {
        buf.put_i16_le(*value);
    }
    buf
}

/// Decode consecutive little-endian `u16`s.
///
/// # Errors
///
/// Fails with [`ParseError::FieldWidth`] on an odd byte count.
pub fn bytes_to_u16s(data: &[u8]) -> ParseResult<Vec<u16>> {
    check_width(data, 2)?;
    let mut buf = data;
    let mut out = Vec::with_capacity(data.len() / 2);
    while buf.has_remaining() {
        out.push(buf.get_u16_le());
    }
    Ok(out)
}

/// Decode consecutive little-endian `i16`s.
pub fn bytes_to_i16s(data: &[u8]) -> ParseResult<Vec<i16>> {
    check_width(data, 2)?;
    let mut buf = data;
    let mut out = Vec::with_capacity(data.len() / 2);
    while buf.has_remaining() {
        out.push(buf.get_i16_le());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u16_little_endian() {
        assert_eq!(u16s_to_bytes(&[0x0032, 0x1234]), vec![0x32, 0x00, 0x34, 0x12]);
        assert_eq!(bytes_to_u16s(&[0x32, 0x00]).unwrap(), vec![50]);
    }

    #[test]
    fn test_i16_negative() {
        assert_eq!(i16s_to_bytes(&[-2]), vec![0xFE, 0xFF]);
        assert_eq!(bytes_to_i16s(&[0xFE, 0xFF, 0x05, 0x00]).unwrap(), vec![-2, 5]);
    }

    #[test]
    fn test_odd_length_rejected() {
        assert_eq!(
            bytes_to_u16s(&[1, 2, 3]),
            Err(ParseError::FieldWidth {
                width: 2,
                actual: 3
            })
        );
        assert!(bytes_to_i16s(&[1]).is_err());
    }

    #[test]
    fn test_empty() {
        assert!(bytes_to_u16s(&[]).unwrap().is_empty());
        assert!(u16s_to_bytes(&[]).is_empty());
    }
}
