//! Configuration module for Tunnelrat
//!
//! This module provides configuration types and parsing for the daemon.

mod ports;
mod server;
mod transport;

pub use ports::PortRangeConfig;
pub use server::{Config, ServerConfig};
pub use transport::{TcpConfig, UdpConfig, UdpFraming};

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config
        .server
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_empty_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.server.ports.start, 10000);
        assert_eq!(config.server.ports.end, 60000);
    }

    #[test]
    fn test_parse_minimal_config() {
        let config_str = r#"
[server]
bind_addr = "127.0.0.1:7001"
"#;

        let config = parse_config(config_str).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:7001");
        assert_eq!(config.server.heartbeat_timeout, 40);
    }

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
[server]
bind_addr = "0.0.0.0:7000"
listen_ip = "127.0.0.1"
heartbeat_timeout = 60
handshake_timeout = 5
tunnel_accept_timeout = 15
write_timeout = 3
buffer_size = 65536

[server.ports]
start = 20000
end = 20100

[server.tcp]
nodelay = false
keepalive_secs = 30
keepalive_interval = 10

[server.udp]
framing = "length_prefixed"
max_datagram_size = 1500
"#;

        let config = parse_config(config_str).unwrap();
        assert_eq!(config.server.heartbeat_timeout, 60);
        assert_eq!(config.server.listen_ip.to_string(), "127.0.0.1");
        assert_eq!(config.server.buffer_size, 65536);
        assert_eq!(config.server.ports.range(), 20000..=20100);
        assert!(!config.server.tcp.nodelay);
        assert_eq!(config.server.udp.framing, UdpFraming::LengthPrefixed);
        assert_eq!(config.server.udp.max_datagram_size, 1500);
    }

    #[test]
    fn test_parse_invalid_config() {
        let config_str = r#"
[server.ports]
start = 50000
end = 40000
"#;
        let err = parse_config(config_str).unwrap_err();
        assert!(err.to_string().contains("Invalid configuration"));
    }

    #[test]
    fn test_parse_malformed_toml() {
        assert!(parse_config("[server").is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind_addr = \"127.0.0.1:7100\"").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:7100");
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/nonexistent/tunnelrat.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
