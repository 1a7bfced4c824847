use crate::error::ProtocolError;
use crate::protocol::{FrameParser, Header, Request};
use std::net::SocketAddr;

/// Per-client connection state: the incremental frame parser on the read
/// side, a single consolidated write buffer on the write side.
///
/// A connection dispatches at most one request at a time: after a frame is
/// decoded, further buffered frames wait until the reply has been fully
/// written. Responses therefore leave in request order on every connection.
pub struct Connection {
    pub session_id: u128,
    pub addr: Option<SocketAddr>,

    parser: FrameParser,

    write_buffer: Vec<u8>,
    write_position: usize,

    awaiting_reply: bool,
    closed: bool,
}

impl Connection {
    pub fn new(session_id: u128, max_request_size: usize, addr: Option<SocketAddr>) -> Self {
        Self {
            session_id,
            addr,
            parser: FrameParser::new(max_request_size),
            write_buffer: Vec::with_capacity(4 * 1024),
            write_position: 0,
            awaiting_reply: false,
            closed: false,
        }
    }

    /// Buffer bytes read off the socket
    pub fn feed(&mut self, data: &[u8]) {
        self.parser.feed(data);
    }

    /// Decode the next buffered request, unless one is already in flight
    pub fn next_request(&mut self) -> Result<Option<(Header, Request)>, ProtocolError> {
        if self.awaiting_reply {
            return Ok(None);
        }
        match self.parser.parse_next()? {
            Some((header, body)) => {
                let request = Request::decode(header, &body)?;
                self.awaiting_reply = true;
                Ok(Some((header, request)))
            }
            None => Ok(None),
        }
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    /// Queue a reply frame for writing
    pub fn queue_reply(&mut self, frame: &[u8]) {
        // Reclaim the buffer once previous writes have fully drained
        if self.write_position >= self.write_buffer.len() {
            self.write_buffer.clear();
            self.write_position = 0;
        }
        self.write_buffer.extend_from_slice(frame);
    }

    /// Mark the in-flight request answered, unblocking the next frame
    pub fn reply_done(&mut self) {
        self.awaiting_reply = false;
    }

    /// Get pending write data as a single buffer slice
    pub fn pending_writes(&mut self) -> Option<&[u8]> {
        if self.write_position < self.write_buffer.len() {
            Some(&self.write_buffer[self.write_position..])
        } else {
            None
        }
    }

    /// Mark bytes as written
    pub fn consume_writes(&mut self, n: usize) {
        self.write_position += n;
    }

    pub fn has_pending_writes(&self) -> bool {
        self.write_position < self.write_buffer.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}
