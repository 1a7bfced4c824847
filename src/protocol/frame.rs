use crate::error::ProtocolError;
use crate::protocol::codec::{encode_frame, Header, Opcode};
use bytes::{BufMut, Bytes, BytesMut};

/// Return codes carried by ACK responses
pub const RC_OK: u8 = 0;
pub const RC_NOK: u8 = 1;

/// One `(ttl, key, value)` triple of a GET-shaped response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub ttl: i32,
    pub key: Bytes,
    pub value: Bytes,
}

/// A decoded client request. The prefix/sync bits stay in the [`Header`];
/// the body shapes are fixed per opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Put { ttl: i32, key: Bytes, value: Bytes },
    Get { key: Bytes },
    Del { key: Bytes },
    Ttl { ttl: i32, key: Bytes },
    Inc { key: Bytes },
    Dec { key: Bytes },
    Cnt { key: Bytes },
    Use { key: Bytes },
    Keys { key: Bytes },
    Ping,
    Quit,
    Db,
    Info,
    Flush,
    Join { host: String, port: u16 },
    /// An ACK arriving as a request; dispatches to a no-op
    Ack,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Put { .. } => Opcode::Put,
            Request::Get { .. } => Opcode::Get,
            Request::Del { .. } => Opcode::Del,
            Request::Ttl { .. } => Opcode::Ttl,
            Request::Inc { .. } => Opcode::Inc,
            Request::Dec { .. } => Opcode::Dec,
            Request::Cnt { .. } => Opcode::Cnt,
            Request::Use { .. } => Opcode::Use,
            Request::Keys { .. } => Opcode::Keys,
            Request::Ping => Opcode::Ping,
            Request::Quit => Opcode::Quit,
            Request::Db => Opcode::Db,
            Request::Info => Opcode::Info,
            Request::Flush => Opcode::Flush,
            Request::Join { .. } => Opcode::Join,
            Request::Ack => Opcode::Ack,
        }
    }

    /// Decode a request body for the opcode carried in `header`
    pub fn decode(header: Header, body: &Bytes) -> Result<Self, ProtocolError> {
        Ok(match header.opcode {
            Opcode::Put => {
                let (ttl, key, value) = decode_kv_body(body)?;
                Request::Put { ttl, key, value }
            }
            Opcode::Get => Request::Get { key: body.clone() },
            Opcode::Del => Request::Del { key: body.clone() },
            Opcode::Inc => Request::Inc { key: body.clone() },
            Opcode::Dec => Request::Dec { key: body.clone() },
            Opcode::Cnt => Request::Cnt { key: body.clone() },
            Opcode::Use => Request::Use { key: body.clone() },
            Opcode::Keys => Request::Keys { key: body.clone() },
            Opcode::Ttl => {
                if body.len() < 4 {
                    return Err(ProtocolError::ShortBody("ttl"));
                }
                let ttl = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                Request::Ttl {
                    ttl,
                    key: body.slice(4..),
                }
            }
            // Empty-bodied commands; a single return-code placeholder byte is
            // tolerated and ignored.
            Opcode::Ping => Request::Ping,
            Opcode::Quit => Request::Quit,
            Opcode::Db => Request::Db,
            Opcode::Info => Request::Info,
            Opcode::Flush => Request::Flush,
            Opcode::Ack => Request::Ack,
            Opcode::Join => {
                let (_, key, _) = decode_kv_body(body)?;
                let (host, port) = parse_address(&key)?;
                Request::Join { host, port }
            }
        })
    }

    /// Pack this request into a complete frame
    pub fn encode(&self, prefix: bool) -> Bytes {
        let header = Header::request(self.opcode()).with_prefix(prefix);
        let body = match self {
            Request::Put { ttl, key, value } => encode_kv_body(*ttl, key, value),
            Request::Get { key }
            | Request::Del { key }
            | Request::Inc { key }
            | Request::Dec { key }
            | Request::Cnt { key }
            | Request::Use { key }
            | Request::Keys { key } => key.to_vec(),
            Request::Ttl { ttl, key } => {
                let mut body = Vec::with_capacity(4 + key.len());
                body.extend_from_slice(&ttl.to_be_bytes());
                body.extend_from_slice(key);
                body
            }
            Request::Ping
            | Request::Quit
            | Request::Db
            | Request::Info
            | Request::Flush
            | Request::Ack => Vec::new(),
            Request::Join { host, port } => {
                let address = format!("{}:{}", host, port);
                encode_kv_body(0, address.as_bytes(), b"")
            }
        };
        encode_frame(header, &body)
    }
}

/// A response ready to be packed. Counted bodies (prefix scans, peer lists)
/// carry a value length per tuple so they stay self-delimiting; the
/// single-tuple body lets the value run to the end of the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack(u8),
    Count(u64),
    Single(Tuple),
    Tuples(Vec<Tuple>),
    Members(Vec<(String, u16)>),
}

impl Response {
    /// Pack into a complete frame. `opcode` is the request's opcode and
    /// shapes the reply header for tuple bodies; ACK, CNT and JOIN replies
    /// carry their own opcode.
    pub fn encode(&self, opcode: Opcode, prefix: bool) -> Bytes {
        match self {
            Response::Ack(rc) => encode_frame(Header::response(Opcode::Ack), &[*rc]),
            Response::Count(count) => {
                encode_frame(Header::response(Opcode::Cnt), &count.to_be_bytes())
            }
            Response::Single(tuple) => {
                let body = encode_kv_body(tuple.ttl, &tuple.key, &tuple.value);
                encode_frame(Header::response(opcode), &body)
            }
            Response::Tuples(tuples) => {
                let body = encode_counted_tuples(tuples.iter());
                encode_frame(Header::response(opcode).with_prefix(prefix), &body)
            }
            Response::Members(members) => {
                let tuples: Vec<Tuple> = members
                    .iter()
                    .map(|(host, port)| Tuple {
                        ttl: 0,
                        key: Bytes::copy_from_slice(host.as_bytes()),
                        value: Bytes::copy_from_slice(port.to_string().as_bytes()),
                    })
                    .collect();
                let body = encode_counted_tuples(tuples.iter());
                encode_frame(Header::response(Opcode::Join), &body)
            }
        }
    }

    /// Decode a response body for the opcode carried in `header`
    pub fn decode(header: Header, body: &Bytes) -> Result<Self, ProtocolError> {
        Ok(match header.opcode {
            Opcode::Ack => {
                let rc = *body.first().ok_or(ProtocolError::ShortBody("ack"))?;
                Response::Ack(rc)
            }
            Opcode::Cnt => {
                if body.len() < 8 {
                    return Err(ProtocolError::ShortBody("count"));
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&body[..8]);
                Response::Count(u64::from_be_bytes(raw))
            }
            Opcode::Join => {
                let tuples = decode_counted_tuples(body)?;
                let mut members = Vec::with_capacity(tuples.len());
                for tuple in tuples {
                    let host = String::from_utf8(tuple.key.to_vec())
                        .map_err(|_| ProtocolError::BadField("member host"))?;
                    let port = std::str::from_utf8(&tuple.value)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or(ProtocolError::BadField("member port"))?;
                    members.push((host, port));
                }
                Response::Members(members)
            }
            _ if header.prefix => Response::Tuples(decode_counted_tuples(body)?),
            _ => {
                let (ttl, key, value) = decode_kv_body(body)?;
                Response::Single(Tuple { ttl, key, value })
            }
        })
    }
}

/// ttl (4) · keylen (2) · key · value
fn encode_kv_body(ttl: i32, key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(6 + key.len() + value.len());
    body.extend_from_slice(&ttl.to_be_bytes());
    body.extend_from_slice(&(key.len() as u16).to_be_bytes());
    body.extend_from_slice(key);
    body.extend_from_slice(value);
    body
}

fn decode_kv_body(body: &Bytes) -> Result<(i32, Bytes, Bytes), ProtocolError> {
    if body.len() < 6 {
        return Err(ProtocolError::ShortBody("key/value"));
    }
    let ttl = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let keylen = usize::from(u16::from_be_bytes([body[4], body[5]]));
    if body.len() < 6 + keylen {
        return Err(ProtocolError::ShortBody("key"));
    }
    let key = body.slice(6..6 + keylen);
    let value = body.slice(6 + keylen..);
    Ok((ttl, key, value))
}

/// count (2) · (ttl (4) · keylen (2) · key · vallen (4) · value)*
fn encode_counted_tuples<'a>(tuples: impl ExactSizeIterator<Item = &'a Tuple>) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u16(tuples.len() as u16);
    for tuple in tuples {
        body.put_i32(tuple.ttl);
        body.put_u16(tuple.key.len() as u16);
        body.put_slice(&tuple.key);
        body.put_u32(tuple.value.len() as u32);
        body.put_slice(&tuple.value);
    }
    body.to_vec()
}

fn decode_counted_tuples(body: &Bytes) -> Result<Vec<Tuple>, ProtocolError> {
    if body.len() < 2 {
        return Err(ProtocolError::ShortBody("tuple count"));
    }
    let count = usize::from(u16::from_be_bytes([body[0], body[1]]));
    let mut tuples = Vec::with_capacity(count.min(1024));
    let mut at = 2;

    for _ in 0..count {
        if body.len() < at + 6 {
            return Err(ProtocolError::ShortBody("tuple"));
        }
        let ttl = i32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);
        let keylen = usize::from(u16::from_be_bytes([body[at + 4], body[at + 5]]));
        at += 6;

        if body.len() < at + keylen + 4 {
            return Err(ProtocolError::ShortBody("tuple key"));
        }
        let key = body.slice(at..at + keylen);
        at += keylen;

        let vallen =
            u32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]) as usize;
        at += 4;

        if body.len() < at + vallen {
            return Err(ProtocolError::ShortBody("tuple value"));
        }
        let value = body.slice(at..at + vallen);
        at += vallen;

        tuples.push(Tuple { ttl, key, value });
    }

    Ok(tuples)
}

fn parse_address(raw: &[u8]) -> Result<(String, u16), ProtocolError> {
    let text =
        std::str::from_utf8(raw).map_err(|_| ProtocolError::BadField("join address"))?;
    let (host, port) = text
        .rsplit_once(':')
        .ok_or(ProtocolError::BadField("join address"))?;
    let port = port
        .parse()
        .map_err(|_| ProtocolError::BadField("join address"))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::FrameParser;

    fn roundtrip(request: Request, prefix: bool) {
        let frame = request.encode(prefix);

        let mut parser = FrameParser::new(1 << 20);
        parser.feed(&frame);
        let (header, body) = parser.parse_next().unwrap().unwrap();

        assert!(header.request);
        assert_eq!(header.prefix, prefix);
        assert_eq!(header.opcode, request.opcode());
        assert_eq!(Request::decode(header, &body).unwrap(), request);
    }

    #[test]
    fn request_roundtrips() {
        roundtrip(
            Request::Put {
                ttl: -1,
                key: Bytes::from_static(b"foo"),
                value: Bytes::from_static(b"bar"),
            },
            false,
        );
        roundtrip(
            Request::Put {
                ttl: 30,
                key: Bytes::from_static(b"pre"),
                value: Bytes::from_static(b""),
            },
            true,
        );
        roundtrip(
            Request::Get {
                key: Bytes::from_static(b"alpha"),
            },
            true,
        );
        roundtrip(
            Request::Del {
                key: Bytes::from_static(b"k"),
            },
            false,
        );
        roundtrip(
            Request::Ttl {
                ttl: 120,
                key: Bytes::from_static(b"session"),
            },
            false,
        );
        roundtrip(
            Request::Cnt {
                key: Bytes::from_static(b""),
            },
            false,
        );
        roundtrip(Request::Ping, false);
        roundtrip(Request::Quit, false);
        roundtrip(Request::Db, false);
        roundtrip(Request::Info, false);
        roundtrip(Request::Flush, false);
        roundtrip(
            Request::Join {
                host: "10.0.0.7".to_string(),
                port: 9090,
            },
            false,
        );
    }

    #[test]
    fn ttl_request_needs_four_bytes() {
        let header = Header::request(Opcode::Ttl);
        let body = Bytes::from_static(b"\x00\x01");
        assert!(matches!(
            Request::decode(header, &body),
            Err(ProtocolError::ShortBody("ttl"))
        ));
    }

    #[test]
    fn put_keylen_is_bounds_checked() {
        let mut body = Vec::new();
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&100u16.to_be_bytes());
        body.extend_from_slice(b"short");

        let header = Header::request(Opcode::Put);
        assert!(matches!(
            Request::decode(header, &Bytes::from(body)),
            Err(ProtocolError::ShortBody("key"))
        ));
    }

    #[test]
    fn ack_response_roundtrip() {
        let frame = Response::Ack(RC_NOK).encode(Opcode::Get, false);

        let mut parser = FrameParser::new(1024);
        parser.feed(&frame);
        let (header, body) = parser.parse_next().unwrap().unwrap();

        assert_eq!(header.opcode, Opcode::Ack);
        assert!(!header.request);
        assert_eq!(
            Response::decode(header, &body).unwrap(),
            Response::Ack(RC_NOK)
        );
    }

    #[test]
    fn count_response_roundtrip() {
        let frame = Response::Count(42).encode(Opcode::Cnt, false);
        let mut parser = FrameParser::new(1024);
        parser.feed(&frame);
        let (header, body) = parser.parse_next().unwrap().unwrap();
        assert_eq!(Response::decode(header, &body).unwrap(), Response::Count(42));
    }

    #[test]
    fn single_tuple_value_runs_to_frame_end() {
        let tuple = Tuple {
            ttl: -1,
            key: Bytes::from_static(b"foo"),
            value: Bytes::from_static(b"bar baz"),
        };
        let frame = Response::Single(tuple.clone()).encode(Opcode::Get, false);

        let mut parser = FrameParser::new(1024);
        parser.feed(&frame);
        let (header, body) = parser.parse_next().unwrap().unwrap();
        assert_eq!(header.opcode, Opcode::Get);
        assert_eq!(
            Response::decode(header, &body).unwrap(),
            Response::Single(tuple)
        );
    }

    #[test]
    fn counted_tuples_roundtrip_with_empty_values() {
        let tuples = vec![
            Tuple {
                ttl: -1,
                key: Bytes::from_static(b"alpha"),
                value: Bytes::from_static(b""),
            },
            Tuple {
                ttl: 30,
                key: Bytes::from_static(b"alphax"),
                value: Bytes::from_static(b"v2"),
            },
        ];
        let frame = Response::Tuples(tuples.clone()).encode(Opcode::Keys, true);

        let mut parser = FrameParser::new(1024);
        parser.feed(&frame);
        let (header, body) = parser.parse_next().unwrap().unwrap();
        assert!(header.prefix);
        assert_eq!(
            Response::decode(header, &body).unwrap(),
            Response::Tuples(tuples)
        );
    }

    #[test]
    fn member_list_roundtrip() {
        let members = vec![
            ("127.0.0.1".to_string(), 19090u16),
            ("10.1.2.3".to_string(), 19191u16),
        ];
        let frame = Response::Members(members.clone()).encode(Opcode::Join, false);

        let mut parser = FrameParser::new(1024);
        parser.feed(&frame);
        let (header, body) = parser.parse_next().unwrap().unwrap();
        assert_eq!(header.opcode, Opcode::Join);
        assert_eq!(
            Response::decode(header, &body).unwrap(),
            Response::Members(members)
        );
    }

    #[test]
    fn truncated_tuple_body_is_rejected() {
        let tuples = vec![Tuple {
            ttl: -1,
            key: Bytes::from_static(b"alpha"),
            value: Bytes::from_static(b"v"),
        }];
        let body = encode_counted_tuples(tuples.iter());
        let truncated = Bytes::copy_from_slice(&body[..body.len() - 1]);

        let header = Header::response(Opcode::Get).with_prefix(true);
        assert!(Response::decode(header, &truncated).is_err());
    }
}
