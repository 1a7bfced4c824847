//! branchdb: an in-memory key-value server with a trie-indexed keyspace.
//!
//! Keys live in a character trie, so alongside the usual point operations the
//! protocol offers prefix-scoped bulk forms of read, delete, set, count,
//! increment/decrement and enumeration. Entries carry an optional TTL,
//! enforced lazily on access and by a periodic sweep. Clients may switch
//! between named databases; an optional UDP bus gossips cluster membership.
//!
//! # Architecture
//!
//! ```text
//!      MAIN              1...N               1...M
//!
//!   ACCEPT LOOP      I/O WORKER POOL   COMMAND WORKER POOL
//!   -----------      ---------------   -------------------
//!        |                  |                   |
//!      accept               |                   |
//!        | ---------------> |                   |
//!        |           read and decode            |
//!        |                  | ----------------> |
//!        |                  |           execute under the
//!        |                  |              store lock
//!        |                  | <---------------- |
//!        |           encode and write           |
//! ```
//!
//! Each stage runs its own mio poll; connections are handed between stages
//! over crossbeam channels paired with poll wakers. The trie store and the
//! expiration index share a single lock.

/// Cluster membership list and JOIN announcements
pub mod cluster;

/// Command handlers, one per opcode
pub mod commands;

/// Configuration management for the server
pub mod config;

/// Error types and result aliases
pub mod error;

/// Network layer: listeners and per-connection state
pub mod network;

/// Binary wire protocol: framing, requests, responses
pub mod protocol;

/// Core staged server implementation
pub mod server;

/// Client session registry
pub mod session;

/// Statistics counters behind the INFO command
pub mod stats;

/// Trie keyspace, databases and the expiration index
pub mod storage;

pub use config::{Config, Mode};
pub use error::{Error, ProtocolError, Result};
pub use server::Server;
