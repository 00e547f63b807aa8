//! Relay and peer configuration
//!
//! Both sides default to the well-known ports. Overrides come from the
//! command line, parsed by hand:
//!
//! ```text
//! lan-relay server [--host H] [--tcp-port N] [--udp-port N]
//! lan-relay peer <server-ip> <name> [--tcp-port N] [--udp-port N]
//! ```

use std::time::Duration;

use crate::error::{Error, Result};

/// Well-known control (TCP) port
pub const TCP_PORT: u16 = 5000;

/// Well-known media (UDP) port
pub const UDP_PORT: u16 = 5001;

/// Largest single read on either transport
pub const BUFFER_SIZE: usize = 65536;

/// Control frames queued per session before it counts as unresponsive
pub const SEND_QUEUE_FRAMES: usize = 128;

/// Relay process settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address both listeners bind to
    pub host: String,
    /// Control channel port
    pub tcp_port: u16,
    /// Media channel port
    pub udp_port: u16,
    /// Receive buffer for control reads and media datagrams
    pub buffer_size: usize,
    /// Upper bound on a single control write before the target is treated as failed
    pub write_timeout: Duration,
    /// Frames a session's writer may fall behind by
    pub send_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            tcp_port: TCP_PORT,
            udp_port: UDP_PORT,
            buffer_size: BUFFER_SIZE,
            write_timeout: Duration::from_secs(5),
            send_queue: SEND_QUEUE_FRAMES,
        }
    }
}

impl RelayConfig {
    /// Build from the arguments following the `server` sub-command.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--host" => config.host = flag_value(arg, iter.next())?.to_string(),
                "--tcp-port" => config.tcp_port = parse_port(arg, iter.next())?,
                "--udp-port" => config.udp_port = parse_port(arg, iter.next())?,
                other => {
                    return Err(Error::InvalidArgument(format!("unknown argument: {other}")));
                }
            }
        }

        Ok(config)
    }

    /// `host:tcp_port`
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.tcp_port)
    }

    /// `host:udp_port`
    pub fn media_addr(&self) -> String {
        format!("{}:{}", self.host, self.udp_port)
    }
}

/// Peer adapter settings
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Relay host name or IP
    pub server: String,
    /// Identity claimed during the handshake
    pub identity: String,
    /// Relay control port
    pub tcp_port: u16,
    /// Relay media port
    pub udp_port: u16,
    /// Receive buffer for control reads and media datagrams
    pub buffer_size: usize,
}

impl PeerConfig {
    pub fn new(server: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            identity: identity.into(),
            tcp_port: TCP_PORT,
            udp_port: UDP_PORT,
            buffer_size: BUFFER_SIZE,
        }
    }

    /// Build from the arguments following the `peer` sub-command.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let (server, identity) = match args {
            [server, identity, ..] if !server.starts_with('-') && !identity.starts_with('-') => {
                (server, identity)
            }
            _ => {
                return Err(Error::InvalidArgument(
                    "expected <server-ip> <name>".to_string(),
                ))
            }
        };

        let mut config = Self::new(server.as_str(), identity.as_str());
        let mut iter = args[2..].iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--tcp-port" => config.tcp_port = parse_port(arg, iter.next())?,
                "--udp-port" => config.udp_port = parse_port(arg, iter.next())?,
                other => {
                    return Err(Error::InvalidArgument(format!("unknown argument: {other}")));
                }
            }
        }

        Ok(config)
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.server, self.tcp_port)
    }

    pub fn media_addr(&self) -> String {
        format!("{}:{}", self.server, self.udp_port)
    }
}

fn flag_value<'a>(flag: &str, value: Option<&'a String>) -> Result<&'a str> {
    value
        .map(String::as_str)
        .ok_or_else(|| Error::InvalidArgument(format!("{flag} needs a value")))
}

fn parse_port(flag: &str, value: Option<&String>) -> Result<u16> {
    let raw = flag_value(flag, value)?;
    raw.parse()
        .map_err(|_| Error::InvalidArgument(format!("{flag}: not a port number: {raw}")))
}
