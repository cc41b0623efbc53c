//! Device configuration.
//!
//! A [`DeviceConfig`] describes one device instance: the name it announces
//! in heartbeats, the UDP port it binds, where discovery bootstraps when no
//! peers are known yet, and where verified inbound files are written.
//!
//! Configuration-file parsing lives in the front-end; the core only
//! consumes the assembled struct.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::DEFAULT_PORT;

/// Configuration for a [`Device`](crate::device::Device).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Name announced in heartbeats; must be unique on the network
    pub name: String,
    /// UDP port to bind on all interfaces
    pub port: u16,
    /// Address heartbeats are sent to while no peers are known
    pub bootstrap: SocketAddr,
    /// Directory verified inbound files are saved into
    pub download_dir: PathBuf,
}

impl DeviceConfig {
    /// Create a configuration with the given name and port and default
    /// bootstrap address (localhost, port 5000) and download directory
    /// (the current directory).
    #[must_use]
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            bootstrap: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            download_dir: PathBuf::from("."),
        }
    }

    /// Set the bootstrap address.
    #[must_use]
    pub fn bootstrap(mut self, addr: SocketAddr) -> Self {
        self.bootstrap = addr;
        self
    }

    /// Set the download directory.
    #[must_use]
    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let name = hostname::get().map_or_else(
            |_| "lanlink-device".to_string(),
            |h| h.to_string_lossy().to_string(),
        );
        Self::new(name, DEFAULT_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_defaults() {
        let config = DeviceConfig::new("alice", 5001);
        assert_eq!(config.name, "alice");
        assert_eq!(config.port, 5001);
        assert_eq!(config.bootstrap.port(), DEFAULT_PORT);
        assert_eq!(config.download_dir, PathBuf::from("."));
    }

    #[test]
    fn test_builder_overrides() {
        let bootstrap = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6000);
        let config = DeviceConfig::new("bob", 5002)
            .bootstrap(bootstrap)
            .download_dir("/tmp/inbox");
        assert_eq!(config.bootstrap, bootstrap);
        assert_eq!(config.download_dir, PathBuf::from("/tmp/inbox"));
    }

    #[test]
    fn test_default_has_nonempty_name() {
        let config = DeviceConfig::default();
        assert!(!config.name.is_empty());
    }
}
