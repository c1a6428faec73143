//! Wire packet codec.
//!
//! Every packet is `[opcode, attribute, length, ..payload]`. Serial and TCP
//! links additionally prefix a single [`START_BYTE`] which is not counted in
//! `length` and is stripped by the framer before a packet is decoded.

use bytes::{BufMut, BytesMut};

use crate::error::{ParseError, ParseResult};
use crate::types::{AttributeType, OpCode};

/// Start-of-frame marker used on serial and TCP links.
pub const START_BYTE: u8 = 0x55;

/// Size of the logical packet header (opcode, attribute, length).
pub const HEADER_LEN: usize = 3;

/// Largest payload a single length byte can describe.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// A decoded rover packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Operation code.
    pub op_code: OpCode,
    /// Attribute the packet refers to.
    pub attribute: AttributeType,
    /// Payload bytes.
    ///
    /// Normally at most 255 bytes. Image captures decoded by the stream
    /// framer are the only packets that exceed this.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet, rejecting payloads that do not fit the length byte.
    pub fn new(
        op_code: OpCode,
        attribute: AttributeType,
        payload: impl Into<Vec<u8>>,
    ) -> ParseResult<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ParseError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            op_code,
            attribute,
            payload,
        })
    }

    /// An empty acknowledgement for `attribute`.
    #[must_use]
    pub fn ack(attribute: AttributeType) -> Self {
        Self {
            op_code: OpCode::Ack,
            attribute,
            payload: Vec::new(),
        }
    }

    /// Encode to `[opcode, attribute, length, ..payload]`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::PayloadTooLarge`] for payloads over 255 bytes.
    pub fn encode(&self) -> ParseResult<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.put_into(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Encode with the serial/TCP start byte in front.
    pub fn encode_framed(&self) -> ParseResult<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(1 + HEADER_LEN + self.payload.len());
        buf.put_u8(START_BYTE);
        self.put_into(&mut buf)?;
        Ok(buf.to_vec())
    }

    fn put_into(&self, buf: &mut BytesMut) -> ParseResult<()> {
        let len = u8::try_from(self.payload.len())
            .map_err(|_| ParseError::PayloadTooLarge(self.payload.len()))?;
        buf.put_u8(self.op_code.as_u8());
        buf.put_u8(self.attribute.as_u8());
        buf.put_u8(len);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Decode a packet (without start byte).
    ///
    /// A missing length byte means an empty payload. Bytes beyond the
    /// declared length are ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use rover_types::{AttributeType, OpCode, Packet};
    ///
    /// let packet = Packet::parse(&[2, 7, 2, 0x10, 0x01]).unwrap();
    /// assert_eq!(packet.op_code, OpCode::Ack);
    /// assert_eq!(packet.attribute, AttributeType::Ultrasonic);
    /// assert_eq!(packet.payload, vec![0x10, 0x01]);
    /// ```
    pub fn parse(data: &[u8]) -> ParseResult<Self> {
        if data.len() < 2 {
            return Err(ParseError::TooShort { actual: data.len() });
        }
        let op_code = OpCode::try_from(data[0])?;
        let attribute = AttributeType::try_from(data[1])?;

        let payload = match data.get(2) {
            None | Some(0) => Vec::new(),
            Some(&declared) => {
                let declared = usize::from(declared);
                let body = &data[HEADER_LEN..];
                if body.len() < declared {
                    return Err(ParseError::LengthMismatch {
                        declared,
                        actual: body.len(),
                    });
                }
                body[..declared].to_vec()
            }
        };

        Ok(Self {
            op_code,
            attribute,
            payload,
        })
    }

    /// One-line human readable form, e.g. `WRITE SPAM_MODE - [1]`.
    #[must_use]
    pub fn describe(&self) -> String {
        describe(self.op_code, self.attribute, &self.payload)
    }
}

/// Render opcode, attribute and payload the way device errors report them.
#[must_use]
pub fn describe(op_code: OpCode, attribute: AttributeType, payload: &[u8]) -> String {
    let bytes: Vec<String> = payload.iter().map(u8::to_string).collect();
    format!("{} {} - [{}]", op_code, attribute, bytes.join(", "))
}


/// Property-based tests for the packet codec.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn any_op_code() -> impl Strategy<Value = OpCode> {
        proptest::sample::select(OpCode::ALL.to_vec())
    }

    fn any_attribute() -> impl Strategy<Value = AttributeType> {
        proptest::sample::select(AttributeType::ALL.to_vec())
    }

    proptest! {
        /// Any valid packet decodes back to itself.
        #[test]
        fn build_then_parse_is_identity(
            op_code in any_op_code(),
            attribute in any_attribute(),
            payload in proptest::collection::vec(any::<u8>(), 0..=255),
        ) {
            let packet = Packet::new(op_code, attribute, payload).unwrap();
            let decoded = Packet::parse(&packet.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, packet);
        }

        /// Parsing arbitrary bytes never panics.
        #[test]
        fn parse_never_panics(data: Vec<u8>) {
            let _ = Packet::parse(&data);
        }
    }
}
