use crate::protocol::Request;
use parking_lot::Mutex;
use std::io;
use std::net::UdpSocket;
use tracing::{debug, info};

/// One node of the membership list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub host: String,
    pub port: u16,
    /// True for exactly one member: this node itself
    pub is_self: bool,
}

/// Loose cluster membership: a deduplicated list of peers plus the identity
/// this node announces. There is no replication and no quorum; JOIN frames
/// over the UDP bus are the whole protocol.
pub struct Membership {
    members: Mutex<Vec<Member>>,
    self_host: String,
    self_port: u16,
}

impl Membership {
    /// Create the list with this node as its only (self) member.
    /// `port` is the TCP listening port; the bus port is derived from it.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            members: Mutex::new(vec![Member {
                host: host.to_string(),
                port,
                is_self: true,
            }]),
            self_host: host.to_string(),
            self_port: port,
        }
    }

    /// Record a peer announced through a JOIN frame. Returns false when the
    /// peer was already known (or is this node itself).
    pub fn add(&self, host: &str, port: u16) -> bool {
        let mut members = self.members.lock();
        if members.iter().any(|m| m.host == host && m.port == port) {
            return false;
        }
        members.push(Member {
            host: host.to_string(),
            port,
            is_self: false,
        });
        info!(host, port, "cluster member joined");
        true
    }

    /// Snapshot of `(host, port)` pairs, self included
    pub fn peers(&self) -> Vec<(String, u16)> {
        self.members
            .lock()
            .iter()
            .map(|m| (m.host.clone(), m.port))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Send a JOIN announcement carrying this node's address to the seed's
    /// bus port. Fire-and-forget: any ACK comes back on our own bus socket.
    pub fn announce(&self, seed_host: &str, seed_port: u16) -> io::Result<()> {
        let frame = Request::Join {
            host: self.self_host.clone(),
            port: self.self_port,
        }
        .encode(false);

        let bus_port = seed_port.saturating_add(10_000);
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.send_to(&frame, (seed_host, bus_port))?;
        debug!(seed_host, bus_port, "sent JOIN announcement");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_self_member() {
        let membership = Membership::new("127.0.0.1", 9090);
        assert_eq!(membership.len(), 1);
        assert_eq!(membership.peers(), vec![("127.0.0.1".to_string(), 9090)]);
    }

    #[test]
    fn add_deduplicates_by_host_and_port() {
        let membership = Membership::new("127.0.0.1", 9090);
        assert!(membership.add("10.0.0.2", 9090));
        assert!(!membership.add("10.0.0.2", 9090));
        assert!(membership.add("10.0.0.2", 9191));
        assert_eq!(membership.len(), 3);
    }

    #[test]
    fn exactly_one_self_member() {
        let membership = Membership::new("127.0.0.1", 9090);
        membership.add("10.0.0.2", 9090);
        let selves = membership
            .members
            .lock()
            .iter()
            .filter(|m| m.is_self)
            .count();
        assert_eq!(selves, 1);
    }
}
