use std::io;
use thiserror::Error;

/// Decode failures reported by the frame parser and body decoders.
///
/// Any of these dropping out of the protocol layer ends the client
/// connection; they are never converted into NOK replies.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("frame length {len} exceeds max request size {max}")]
    Oversize { len: usize, max: usize },

    #[error("malformed length field")]
    MalformedLength,

    #[error("frame body too short for {0}")]
    ShortBody(&'static str),

    #[error("malformed {0} field")]
    BadField(&'static str),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("server shutting down")]
    Shutdown,

    #[error("system error: {0}")]
    System(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
