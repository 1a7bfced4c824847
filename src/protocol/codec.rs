use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};

/// Highest body length representable by the 4-byte length field
pub const MAX_BODY_LEN: usize = (1 << 28) - 1;

/// Command opcodes, stored in the high nibble of the header byte.
///
/// ```text
/// OPCODE |    BIN    | HEX
/// -------|-----------|------
///  ACK   | 0000....  | 0x0
///  PUT   | 0001....  | 0x1
///  GET   | 0010....  | 0x2
///  ...
///  JOIN  | 1111....  | 0xf
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Ack = 0,
    Put = 1,
    Get = 2,
    Del = 3,
    Ttl = 4,
    Inc = 5,
    Dec = 6,
    Cnt = 7,
    Use = 8,
    Keys = 9,
    Ping = 10,
    Quit = 11,
    Db = 12,
    Info = 13,
    Flush = 14,
    Join = 15,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Opcode::Ack,
            1 => Opcode::Put,
            2 => Opcode::Get,
            3 => Opcode::Del,
            4 => Opcode::Ttl,
            5 => Opcode::Inc,
            6 => Opcode::Dec,
            7 => Opcode::Cnt,
            8 => Opcode::Use,
            9 => Opcode::Keys,
            10 => Opcode::Ping,
            11 => Opcode::Quit,
            12 => Opcode::Db,
            13 => Opcode::Info,
            14 => Opcode::Flush,
            15 => Opcode::Join,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// The fixed header byte, MQTT-style:
///
/// ```text
/// | Bit  | 7 | 6 | 5 | 4 |   3    |  2   |    1    |    0     |
/// |------|---------------|--------|------|---------|----------|
/// |      |    opcode     | prefix | sync | request | reserved |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: Opcode,
    pub prefix: bool,
    pub sync: bool,
    pub request: bool,
}

impl Header {
    pub fn request(opcode: Opcode) -> Self {
        Self {
            opcode,
            prefix: false,
            sync: false,
            request: true,
        }
    }

    pub fn response(opcode: Opcode) -> Self {
        Self {
            opcode,
            prefix: false,
            sync: false,
            request: false,
        }
    }

    pub fn with_prefix(mut self, prefix: bool) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn byte(&self) -> u8 {
        (self.opcode as u8) << 4
            | u8::from(self.prefix) << 3
            | u8::from(self.sync) << 2
            | u8::from(self.request) << 1
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        Ok(Self {
            opcode: Opcode::try_from(byte >> 4)?,
            prefix: byte & 0b0000_1000 != 0,
            sync: byte & 0b0000_0100 != 0,
            request: byte & 0b0000_0010 != 0,
        })
    }
}

/// Append the body length as a 7-bit-continuation varint (at most 4 bytes)
pub fn encode_length(out: &mut Vec<u8>, mut len: usize) {
    debug_assert!(len <= MAX_BODY_LEN);
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Decode a varint length from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the decoded
/// length and the number of length bytes consumed.
pub fn decode_length(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut len = 0usize;
    let mut shift = 0u32;

    for (i, &byte) in buf.iter().take(4).enumerate() {
        len |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((len, i + 1)));
        }
        if i == 3 {
            return Err(ProtocolError::MalformedLength);
        }
        shift += 7;
    }

    Ok(None)
}

/// Incremental frame decoder.
///
/// Bytes are fed in as they arrive off the socket; `parse_next` yields one
/// `(header, body)` per complete frame and never mutates partial input.
pub struct FrameParser {
    buffer: BytesMut,
    max_body: usize,
}

impl FrameParser {
    pub fn new(max_body: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            max_body,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Parse the next complete frame, if the buffer holds one
    pub fn parse_next(&mut self) -> Result<Option<(Header, Bytes)>, ProtocolError> {
        if self.buffer.len() < 2 {
            return Ok(None);
        }

        let header = Header::from_byte(self.buffer[0])?;

        let (body_len, len_bytes) = match decode_length(&self.buffer[1..])? {
            Some(decoded) => decoded,
            None => return Ok(None),
        };

        if body_len > self.max_body {
            return Err(ProtocolError::Oversize {
                len: body_len,
                max: self.max_body,
            });
        }

        let total = 1 + len_bytes + body_len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame = self.buffer.split_to(total).freeze();
        let body = frame.slice(1 + len_bytes..);
        Ok(Some((header, body)))
    }
}

/// Pack a complete frame: header byte, varint length, body
pub fn encode_frame(header: Header, body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(1 + 4 + body.len());
    out.push(header.byte());
    encode_length(&mut out, body.len());
    out.extend_from_slice(body);
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bits_roundtrip() {
        let header = Header::request(Opcode::Put).with_prefix(true);
        let byte = header.byte();
        assert_eq!(byte, 0b0001_1010);
        assert_eq!(Header::from_byte(byte).unwrap(), header);

        let response = Header::response(Opcode::Ack);
        assert_eq!(response.byte(), 0b0000_0000);
    }

    #[test]
    fn every_nibble_is_an_opcode() {
        for raw in 0u8..16 {
            assert_eq!(Opcode::try_from(raw).unwrap() as u8, raw);
        }
        assert!(matches!(
            Opcode::try_from(16),
            Err(ProtocolError::UnknownOpcode(16))
        ));
    }

    #[test]
    fn varint_boundaries() {
        for len in [0usize, 1, 127, 128, 16_383, 16_384, 2_097_151, MAX_BODY_LEN] {
            let mut out = Vec::new();
            encode_length(&mut out, len);
            assert!(out.len() <= 4);
            let (decoded, consumed) = decode_length(&out).unwrap().unwrap();
            assert_eq!(decoded, len);
            assert_eq!(consumed, out.len());
        }
    }

    #[test]
    fn varint_rejects_five_byte_lengths() {
        let raw = [0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(
            decode_length(&raw),
            Err(ProtocolError::MalformedLength)
        );
    }

    #[test]
    fn varint_asks_for_more_bytes() {
        assert_eq!(decode_length(&[0x80]).unwrap(), None);
        assert_eq!(decode_length(&[]).unwrap(), None);
    }

    #[test]
    fn parser_handles_byte_by_byte_delivery() {
        let frame = encode_frame(Header::request(Opcode::Get), b"mykey");

        let mut parser = FrameParser::new(1024);
        for &byte in frame[..frame.len() - 1].iter() {
            parser.feed(&[byte]);
            assert!(parser.parse_next().unwrap().is_none());
        }
        parser.feed(&frame[frame.len() - 1..]);

        let (header, body) = parser.parse_next().unwrap().unwrap();
        assert_eq!(header.opcode, Opcode::Get);
        assert!(header.request);
        assert_eq!(body.as_ref(), b"mykey");
    }

    #[test]
    fn parser_yields_pipelined_frames_in_order() {
        let mut parser = FrameParser::new(1024);
        parser.feed(&encode_frame(Header::request(Opcode::Ping), b""));
        parser.feed(&encode_frame(Header::request(Opcode::Get), b"k"));

        let (first, _) = parser.parse_next().unwrap().unwrap();
        assert_eq!(first.opcode, Opcode::Ping);
        let (second, body) = parser.parse_next().unwrap().unwrap();
        assert_eq!(second.opcode, Opcode::Get);
        assert_eq!(body.as_ref(), b"k");
        assert!(parser.parse_next().unwrap().is_none());
    }

    #[test]
    fn oversize_body_is_rejected() {
        let mut parser = FrameParser::new(16);
        let frame = encode_frame(Header::request(Opcode::Put), &[0u8; 64]);
        parser.feed(&frame);
        assert!(matches!(
            parser.parse_next(),
            Err(ProtocolError::Oversize { len: 64, max: 16 })
        ));
    }
}
