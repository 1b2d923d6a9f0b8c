use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use super::types::Role;

/// Keepalive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Silence after which the peer is probed
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub interval: Duration,
    /// Deadline for one probe round trip
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub probe_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            interval: Duration::from_secs(2),
            probe_timeout: Duration::from_millis(800),
        }
    }
}

/// Configuration for one end of the link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Which side of the link this is
    pub role: Role,
    /// Peer address for a client, bind address for a server
    pub addr: SocketAddr,
    /// Deadline for an outbound connect
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub connect_timeout: Duration,
    /// Poll period while waiting for a peer to connect
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub listen_poll_timeout: Duration,
    /// Poll period while waiting for inbound bytes
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub ready_poll_timeout: Duration,
    /// Pause after the client reads end-of-stream
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub peer_closed_delay: Duration,
    /// Wait between checks while idle, and pause after a failed cycle
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub idle_poll_interval: Duration,
    /// Deadline for writing one frame
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub write_timeout: Duration,
    /// Liveness probing
    pub keepalive: KeepaliveConfig,
}

impl Config {
    /// Client connecting to `addr`
    pub fn client(addr: SocketAddr) -> Self {
        Config {
            role: Role::Client,
            addr,
            connect_timeout: Duration::from_secs(3),
            listen_poll_timeout: Duration::from_millis(1100),
            ready_poll_timeout: Duration::from_millis(500),
            peer_closed_delay: Duration::from_millis(100),
            idle_poll_interval: Duration::from_millis(100),
            write_timeout: Duration::from_secs(1),
            keepalive: KeepaliveConfig::default(),
        }
    }

    /// Server listening on `addr`
    pub fn server(addr: SocketAddr) -> Self {
        Config {
            role: Role::Server,
            ready_poll_timeout: Duration::from_millis(1100),
            ..Config::client(addr)
        }
    }

    /// Checks that every deadline is usable
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("connect_timeout", self.connect_timeout),
            ("listen_poll_timeout", self.listen_poll_timeout),
            ("ready_poll_timeout", self.ready_poll_timeout),
            ("idle_poll_interval", self.idle_poll_interval),
            ("write_timeout", self.write_timeout),
            ("keepalive.interval", self.keepalive.interval),
            ("keepalive.probe_timeout", self.keepalive.probe_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::config(format!("{} must be non-zero", name)));
        }
        if self.keepalive.probe_timeout >= self.keepalive.interval {
            return Err(Error::config("keepalive probe timeout must be shorter than its interval"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::client(SocketAddr::new(
            IpAddr::V4(super::DEFAULT_SERVER_IP),
            super::DEFAULT_PORT,
        ))
    }
}

/// Address a server binds to by default
pub fn default_bind_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), super::DEFAULT_PORT)
}
