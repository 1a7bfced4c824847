use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Backlog ceiling applied to the `tcp_backlog` knob.
pub const MAX_TCP_BACKLOG: i32 = 4096;

/// Operating mode of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "STANDALONE", alias = "standalone")]
    Standalone,
    #[serde(rename = "CLUSTER", alias = "cluster")]
    Cluster,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STANDALONE" => Ok(Mode::Standalone),
            "CLUSTER" => Ok(Mode::Cluster),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level: DEBUG, INFO/INFORMATION, WARNING or ERROR
    pub log_level: String,

    /// Log file path (stdout when unset)
    pub log_path: Option<String>,

    /// UNIX-domain socket path; when set, takes precedence over TCP
    pub unix_socket: Option<String>,

    /// Bind address for the TCP family
    pub ip_address: String,

    /// Port to listen on
    pub ip_port: u16,

    /// Soft cap on keyspace memory, e.g. "2GB" (advisory)
    pub max_memory: String,

    /// Period between memory checks, e.g. "60s"
    pub mem_reclaim_time: String,

    /// Hard cap on a decoded frame body, e.g. "2MB"
    pub max_request_size: String,

    /// Listen queue depth, clamped to [1, 4096]
    pub tcp_backlog: i32,

    /// STANDALONE or CLUSTER
    pub mode: Mode,

    /// Number of I/O worker threads (0 = number of CPUs)
    pub io_threads: usize,

    /// Number of command worker threads (0 = number of CPUs)
    pub worker_threads: usize,

    /// Period between expiration sweeps, in milliseconds
    pub ttl_sweep_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            log_path: None,
            unix_socket: None,
            ip_address: "127.0.0.1".to_string(),
            ip_port: 9090,
            max_memory: "2GB".to_string(),
            mem_reclaim_time: "60s".to_string(),
            max_request_size: "2MB".to_string(),
            tcp_backlog: 128,
            mode: Mode::Standalone,
            io_threads: 1,
            worker_threads: 2,
            ttl_sweep_interval_ms: 200,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use branchdb::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("branchdb.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.unix_socket.is_none() && self.ip_port == 0 {
            anyhow::bail!("ip_port must be > 0 when no unix_socket is set");
        }

        if self.mode == Mode::Cluster {
            if self.unix_socket.is_some() {
                anyhow::bail!("cluster mode requires a TCP listener");
            }
            if u32::from(self.ip_port) + 10_000 > u32::from(u16::MAX) {
                anyhow::bail!("ip_port {} leaves no room for the bus port", self.ip_port);
            }
        }

        if self.max_request_size_bytes() == 0 {
            anyhow::bail!("max_request_size must be > 0");
        }

        if self.ttl_sweep_interval_ms == 0 {
            anyhow::bail!("ttl_sweep_interval_ms must be > 0");
        }

        Ok(())
    }

    /// Number of I/O threads after resolving the 0 = auto default
    pub fn io_thread_count(&self) -> usize {
        if self.io_threads == 0 {
            num_cpus::get()
        } else {
            self.io_threads
        }
    }

    /// Number of command worker threads after resolving the 0 = auto default
    pub fn worker_thread_count(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }

    pub fn max_memory_bytes(&self) -> usize {
        parse_memory(&self.max_memory)
    }

    pub fn max_request_size_bytes(&self) -> usize {
        parse_memory(&self.max_request_size)
    }

    pub fn mem_reclaim_secs(&self) -> u64 {
        parse_time(&self.mem_reclaim_time)
    }

    /// Listen backlog clamped to the supported range
    pub fn backlog(&self) -> i32 {
        self.tcp_backlog.clamp(1, MAX_TCP_BACKLOG)
    }

    /// UDP bus port used for cluster membership frames
    pub fn bus_port(&self) -> u16 {
        self.ip_port.saturating_add(10_000)
    }
}

/// Parse a memory amount with an optional kb/mb/gb suffix, e.g. "512mb".
/// Bare numbers are bytes. Unknown suffixes fall back to bytes.
pub fn parse_memory(s: &str) -> usize {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    let num: usize = digits.parse().unwrap_or(0);
    let suffix = s[digits.len()..].trim().to_ascii_lowercase();

    let mul = match suffix.as_str() {
        "kb" | "k" => 1024,
        "mb" | "m" => 1024 * 1024,
        "gb" | "g" => 1024 * 1024 * 1024,
        _ => 1,
    };

    num * mul
}

/// Parse a duration in seconds with an optional m (minutes) or d (days)
/// suffix, e.g. "5m". Bare numbers are seconds.
pub fn parse_time(s: &str) -> u64 {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    let num: u64 = digits.parse().unwrap_or(0);
    let suffix = s[digits.len()..].trim();

    let mul = match suffix.chars().next() {
        Some('m') => 60,
        Some('d') => 60 * 60 * 24,
        _ => 1,
    };

    num * mul
}

/// Format a byte amount in a human-readable unit, e.g. "18Kb" or "2Gb"
pub fn memory_to_string(memory: usize) -> String {
    if memory < 1024 {
        format!("{}b", memory)
    } else if memory < 1024 * 1024 {
        format!("{}Kb", memory / 1024)
    } else if memory < 1024 * 1024 * 1024 {
        format!("{}Mb", memory / (1024 * 1024))
    } else {
        format!("{}Gb", memory / (1024 * 1024 * 1024))
    }
}

/// Format a duration in seconds in a human-readable unit, e.g. "2m" or "4h"
pub fn time_to_string(time: u64) -> String {
    if time < 60 {
        format!("{}s", time)
    } else if time < 60 * 60 {
        format!("{}m", time / 60)
    } else if time < 60 * 60 * 24 {
        format!("{}h", time / (60 * 60))
    } else {
        format!("{}d", time / (60 * 60 * 24))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn memory_units() {
        assert_eq!(parse_memory("512"), 512);
        assert_eq!(parse_memory("2kb"), 2048);
        assert_eq!(parse_memory("3MB"), 3 * 1024 * 1024);
        assert_eq!(parse_memory("1gb"), 1024 * 1024 * 1024);
    }

    #[test]
    fn time_units() {
        assert_eq!(parse_time("45"), 45);
        assert_eq!(parse_time("45s"), 45);
        assert_eq!(parse_time("2m"), 120);
        assert_eq!(parse_time("1d"), 86_400);
    }

    #[test]
    fn humanized_units() {
        assert_eq!(memory_to_string(64), "64b");
        assert_eq!(memory_to_string(18 * 1024), "18Kb");
        assert_eq!(memory_to_string(2 * 1024 * 1024 * 1024), "2Gb");
        assert_eq!(time_to_string(45), "45s");
        assert_eq!(time_to_string(7200), "2h");
    }

    #[test]
    fn load_partial_toml() {
        let mut file = NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
ip_port = 7777
max_request_size = "4MB"
mode = "CLUSTER"
"#
        )
        .expect("write config");

        let config = Config::from_file(file.path()).expect("load config");
        assert_eq!(config.ip_port, 7777);
        assert_eq!(config.max_request_size_bytes(), 4 * 1024 * 1024);
        assert_eq!(config.mode, Mode::Cluster);
        // Untouched keys keep their defaults
        assert_eq!(config.ip_address, "127.0.0.1");
        config.validate().expect("valid");
    }

    #[test]
    fn validate_rejects_bus_port_overflow() {
        let config = Config {
            ip_port: 60_000,
            mode: Mode::Cluster,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backlog_is_clamped() {
        let config = Config {
            tcp_backlog: 1_000_000,
            ..Default::default()
        };
        assert_eq!(config.backlog(), MAX_TCP_BACKLOG);
    }
}
