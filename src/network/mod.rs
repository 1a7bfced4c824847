mod connection;
mod listener;

pub use connection::Connection;
pub use listener::{Acceptor, ClientStream};
