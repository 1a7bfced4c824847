//! Binary wire protocol: a one-byte header (opcode + flag bits), a
//! 7-bit-continuation body length of at most four bytes, then the body.
//! All multi-byte integers travel big-endian.

pub mod codec;
pub mod frame;

pub use codec::{decode_length, encode_frame, encode_length, FrameParser, Header, Opcode};
pub use frame::{Request, Response, Tuple, RC_NOK, RC_OK};
