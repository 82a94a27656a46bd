pub mod codec;
pub mod mesh;
pub mod node;

use std::net::{IpAddr, SocketAddr};

use crate::common::error::ConfigError;
use crate::ordering::peers::PeerIdentity;

/*
    Links are point-to-point TCP streams carrying newline-delimited JSON
    envelopes. They are assumed reliable and FIFO while they stay up: an
    envelope written before another is read before it. When we refer to a
    "broadcast", it is the sender writing the same envelope to every open
    link and handing a copy to itself.
*/

pub use codec::*;
pub use mesh::*;
pub use node::*;

/// Well-known port every node listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 4000;

/// Where to dial a peer, and the identity it is known by.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PeerAddress {
    pub identity: PeerIdentity,
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(identity: PeerIdentity, host: impl Into<String>, port: u16) -> Self {
        PeerAddress {
            identity,
            host: host.into(),
            port,
        }
    }

    /// Parses `host` or `host:port`. The identity drops the port when it is
    /// the default one, so `10.0.0.2` and `10.0.0.2:4000` name the same peer.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, ConfigError> {
        let input = input.trim();
        let invalid = |reason: &str| ConfigError::InvalidPeer {
            addr: input.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = if let Ok(addr) = input.parse::<SocketAddr>() {
            (addr.ip().to_string(), addr.port())
        } else if let Ok(ip) = input.parse::<IpAddr>() {
            (ip.to_string(), default_port)
        } else if let Some((host, port)) = input.rsplit_once(':') {
            let port = port.parse::<u16>().map_err(|_| invalid("port is not a number in 0-65535"))?;
            (host.to_string(), port)
        } else {
            (input.to_string(), default_port)
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        if port == 0 {
            return Err(invalid("port 0 cannot be dialed"));
        }
        Ok(PeerAddress::new(identity_for(&host, port, default_port), host, port))
    }
}

pub fn identity_for(host: &str, port: u16, default_port: u16) -> PeerIdentity {
    if port == default_port {
        PeerIdentity::new(host)
    } else if host.contains(':') {
        PeerIdentity::new(format!("[{host}]:{port}"))
    } else {
        PeerIdentity::new(format!("{host}:{port}"))
    }
}
