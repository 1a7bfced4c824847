use crate::config::{memory_to_string, time_to_string, Config, Mode};
use crate::storage::{unix_now, Store};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters behind the INFO command.
///
/// All increments are relaxed; the numbers are informational and a few units
/// of drift between threads is acceptable.
#[derive(Debug)]
pub struct ServerInfo {
    start_time: i64,
    nclients: AtomicU64,
    nconnections: AtomicU64,
    nrequests: AtomicU64,
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    nnodes: AtomicU64,
}

impl ServerInfo {
    pub fn new() -> Self {
        Self {
            start_time: unix_now(),
            nclients: AtomicU64::new(0),
            nconnections: AtomicU64::new(0),
            nrequests: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            nnodes: AtomicU64::new(0),
        }
    }

    pub fn client_connected(&self) {
        self.nclients.fetch_add(1, Ordering::Relaxed);
        self.nconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        // Saturating: a double disconnect must not wrap the gauge
        let _ = self
            .nclients
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn request_served(&self) {
        self.nrequests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_recv(&self, n: u64) {
        self.bytes_recv.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn node_seen(&self) {
        self.nnodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clients(&self) -> u64 {
        self.nclients.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.nrequests.load(Ordering::Relaxed)
    }

    /// Render the INFO payload
    pub fn render(&self, store: &Store, config: &Config) -> String {
        let uptime = (unix_now() - self.start_time).max(0) as u64;
        let mode = match config.mode {
            Mode::Standalone => "standalone",
            Mode::Cluster => "cluster",
        };

        let mut out = String::with_capacity(256);
        let _ = writeln!(out, "version:{}", env!("CARGO_PKG_VERSION"));
        let _ = writeln!(out, "mode:{}", mode);
        let _ = writeln!(out, "uptime_secs:{}", uptime);
        let _ = writeln!(out, "uptime:{}", time_to_string(uptime));
        let _ = writeln!(out, "clients:{}", self.nclients.load(Ordering::Relaxed));
        let _ = writeln!(
            out,
            "total_connections:{}",
            self.nconnections.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "requests:{}", self.nrequests.load(Ordering::Relaxed));
        let _ = writeln!(out, "bytes_recv:{}", self.bytes_recv.load(Ordering::Relaxed));
        let _ = writeln!(out, "bytes_sent:{}", self.bytes_sent.load(Ordering::Relaxed));
        let _ = writeln!(out, "nodes:{}", self.nnodes.load(Ordering::Relaxed));
        let _ = writeln!(out, "databases:{}", store.database_count());
        let _ = writeln!(out, "keys:{}", store.total_keys());
        let _ = writeln!(out, "expiring_keys:{}", store.expiring_len());
        let _ = writeln!(out, "memory_used:{}", memory_to_string(store.approx_memory()));
        let _ = writeln!(
            out,
            "max_memory:{}",
            memory_to_string(config.max_memory_bytes())
        );
        out
    }
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::storage::{DEFAULT_DB, NO_TTL};

    #[test]
    fn gauges_track_connect_disconnect() {
        let info = ServerInfo::new();
        info.client_connected();
        info.client_connected();
        info.client_disconnected();
        assert_eq!(info.clients(), 1);

        info.client_disconnected();
        info.client_disconnected();
        assert_eq!(info.clients(), 0);
    }

    #[test]
    fn render_includes_keyspace_counters() {
        let info = ServerInfo::new();
        let store = Store::new();
        store.insert(DEFAULT_DB, b"k", Bytes::from_static(b"v"), NO_TTL);
        info.request_served();

        let text = info.render(&store, &Config::default());
        assert!(text.contains("keys:1"));
        assert!(text.contains("requests:1"));
        assert!(text.contains("mode:standalone"));
        assert!(text.contains("max_memory:2Gb"));
    }
}
