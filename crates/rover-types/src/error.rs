//! Error types for packet parsing in rover-types.

use thiserror::Error;

/// Errors that can occur when decoding rover packets or payload fields.
///
/// This error type is transport-agnostic and does not include
/// I/O or BLE errors (those belong in rover-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Packet shorter than the opcode + attribute header.
    #[error("Packet too short: {actual} bytes (need at least 2)")]
    TooShort {
        /// Number of bytes received.
        actual: usize,
    },

    /// Declared payload length exceeds the bytes actually present.
    #[error("Payload length mismatch: header declares {declared} bytes, {actual} present")]
    LengthMismatch {
        /// Length byte from the header.
        declared: usize,
        /// Bytes following the header.
        actual: usize,
    },

    /// Payload does not fit the single length byte.
    #[error("Payload too large: {0} bytes (max 255)")]
    PayloadTooLarge(usize),

    /// Opcode byte outside the known set.
    #[error("Unknown opcode: 0x{0:02X}")]
    UnknownOpCode(u8),

    /// Attribute type byte outside the known set.
    #[error("Unknown attribute type: 0x{0:02X}")]
    UnknownAttribute(u8),

    /// Byte count is not a multiple of the field width.
    #[error("Expected a multiple of {width} bytes, got {actual}")]
    FieldWidth {
        /// Width of one field in bytes.
        width: usize,
        /// Number of bytes supplied.
        actual: usize,
    },
}

/// Result type alias using rover-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        assert_eq!(
            ParseError::TooShort { actual: 1 }.to_string(),
            "Packet too short: 1 bytes (need at least 2)"
        );
        assert!(ParseError::UnknownOpCode(0xAB).to_string().contains("0xAB"));
        assert!(
            ParseError::LengthMismatch {
                declared: 8,
                actual: 3
            }
            .to_string()
            .contains("declares 8")
        );
    }
}
