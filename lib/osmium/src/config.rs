use serde_derive::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Transport enablement. At least one of the two listeners must be active.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Protocols {
    pub tcp: bool,
    pub udp: bool,
}

impl Default for Protocols {
    fn default() -> Protocols {
        Protocols { tcp: true, udp: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address shared by the TCP and UDP listeners.
    pub address: String,
    pub port: u16,
    pub protocols: Protocols,
    /// Number of message handler threads.
    pub worker_pool: usize,
    /// Number of outbound dispatch threads.
    pub sender_pool: usize,
    /// Capacity of the inbound and outbound message queues.
    pub queue_size: usize,
    /// Seconds between key file change checks.
    pub keyupdate_interval: u64,
    /// Seconds of inactivity before an agent's rids journal handle is closed.
    pub rids_closing_time: u64,
    /// Milliseconds the event loop blocks waiting for socket readiness.
    pub notify_timeout_ms: u64,
    /// Maximum accepted payload size; larger TCP frames close the connection.
    pub max_message_size: usize,
    /// High-water cap of a per-connection send ring.
    pub send_buffer_size: usize,
    pub keys_file: PathBuf,
    pub rids_dir: PathBuf,
    pub bus_socket: PathBuf,
    pub key_request_socket: PathBuf,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            address: "0.0.0.0".to_string(),
            port: 1514,
            protocols: Protocols::default(),
            worker_pool: 4,
            sender_pool: 8,
            queue_size: 16384,
            keyupdate_interval: 10,
            rids_closing_time: 300,
            notify_timeout_ms: 1000,
            max_message_size: 65536,
            send_buffer_size: 8 * 65536,
            keys_file: PathBuf::from("etc/client.keys"),
            rids_dir: PathBuf::from("queue/rids"),
            bus_socket: PathBuf::from("queue/sockets/queue"),
            key_request_socket: PathBuf::from("queue/sockets/krequest"),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum ConfigError {
    Range {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    NoProtocol,
    SendBufferTooSmall,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Range { name, value, min, max } => {
                write!(f, "{} = {} is outside the allowed range [{}..{}]", name, value, min, max)
            }
            ConfigError::NoProtocol => write!(f, "at least one of TCP and UDP must be enabled"),
            ConfigError::SendBufferTooSmall => {
                write!(f, "send_buffer_size must hold at least one maximum-size frame")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn check_range(name: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Range { name, value, min, max });
    }
    Ok(())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Config {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("worker_pool", self.worker_pool as u64, 1, 16)?;
        check_range("sender_pool", self.sender_pool as u64, 1, 64)?;
        check_range("keyupdate_interval", self.keyupdate_interval, 1, 3600)?;
        check_range("rids_closing_time", self.rids_closing_time, 1, 86400)?;
        check_range("queue_size", self.queue_size as u64, 2, 1 << 24)?;
        check_range("notify_timeout_ms", self.notify_timeout_ms, 1, 60000)?;
        check_range("max_message_size", self.max_message_size as u64, 1024, 1 << 24)?;

        if !self.protocols.tcp && !self.protocols.udp {
            return Err(ConfigError::NoProtocol);
        }

        if self.send_buffer_size < self.max_message_size + 4 {
            return Err(ConfigError::SendBufferTooSmall);
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr(), "0.0.0.0:1514");
    }

    #[test]
    fn test_rejects_oversized_pools() {
        let mut config = Config::default();
        config.worker_pool = 17;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Range { name: "worker_pool", value: 17, min: 1, max: 16 })
        );

        config.worker_pool = 16;
        config.sender_pool = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Range { name: "sender_pool", value: 0, min: 1, max: 64 })
        );
    }

    #[test]
    fn test_rejects_empty_protocol_mask() {
        let mut config = Config::default();
        config.protocols.tcp = false;
        config.protocols.udp = false;
        assert_eq!(config.validate(), Err(ConfigError::NoProtocol));
    }

    #[test]
    fn test_rejects_undersized_send_buffer() {
        let mut config = Config::default();
        config.send_buffer_size = config.max_message_size;
        assert_eq!(config.validate(), Err(ConfigError::SendBufferTooSmall));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = serdeconv::from_toml_str(
            r#"
port = 1515
worker_pool = 2

[protocols]
tcp = true
udp = false
"#,
        )
        .unwrap();

        assert_eq!(config.port, 1515);
        assert_eq!(config.worker_pool, 2);
        assert!(!config.protocols.udp);
        assert_eq!(config.queue_size, Config::default().queue_size);
    }
}
