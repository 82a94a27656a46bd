use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::common::error::ConfigError;
use crate::network::mesh::RetryPolicy;
use crate::network::{identity_for, PeerAddress, DEFAULT_PORT};
use crate::ordering::driver::DEFAULT_RATE;
use crate::ordering::peers::PeerIdentity;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;

/// Totally ordered broadcast between a fixed set of peers.
#[derive(Parser, Debug, Clone)]
#[command(name = "simple-tom", version)]
pub struct Args {
    /// Other peers, as `host` or `host:port`.
    #[arg(required = true, value_name = "PEERS")]
    pub peers: Vec<String>,

    /// Identity announced to peers. Defaults to this machine's address
    /// towards the first peer.
    #[arg(long, env = "TOM_ID")]
    pub id: Option<String>,

    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Originations per second.
    #[arg(long, default_value_t = DEFAULT_RATE)]
    pub rate: f64,

    /// Dial attempts after the first before a peer is given up on.
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_MS)]
    pub retry_delay_ms: u64,

    /// Directory for the `messages_<id>.log` delivery log.
    #[arg(long, default_value = ".")]
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: PeerIdentity,
    pub bind: IpAddr,
    pub port: u16,
    pub peers: Vec<PeerAddress>,
    pub rate: f64,
    pub retry: RetryPolicy,
    pub log_dir: PathBuf,
}

impl TryFrom<Args> for NodeConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if !(args.rate.is_finite() && args.rate > 0.0) {
            return Err(ConfigError::InvalidRate(args.rate));
        }

        let mut peers = args
            .peers
            .iter()
            .map(|peer| PeerAddress::parse(peer, DEFAULT_PORT))
            .collect::<Result<Vec<_>, _>>()?;

        let id = match args.id {
            Some(id) => PeerIdentity::new(id),
            None => {
                let ip = peers
                    .first()
                    .and_then(local_ip_towards)
                    .ok_or(ConfigError::NoLocalAddress)?;
                identity_for(&ip.to_string(), args.port, DEFAULT_PORT)
            }
        };

        peers.retain(|peer| peer.identity != id);
        peers.sort_by(|a, b| a.identity.cmp(&b.identity));
        peers.dedup_by(|a, b| a.identity == b.identity);

        Ok(NodeConfig {
            id,
            bind: args.bind,
            port: args.port,
            peers,
            rate: args.rate,
            retry: RetryPolicy {
                max_retries: args.max_retries,
                delay: Duration::from_millis(args.retry_delay_ms),
            },
            log_dir: args.log_dir,
        })
    }
}

/// Address of the interface the OS would route to `peer` through. Connecting
/// a UDP socket only selects a route, nothing is sent.
fn local_ip_towards(peer: &PeerAddress) -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((peer.host.as_str(), peer.port)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("simple-tom").chain(argv.iter().copied()))
    }

    #[test]
    fn test_missing_peers_is_a_usage_error() {
        let err = parse(&[]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["10.0.0.2", "10.0.0.3", "--id", "10.0.0.1"]).unwrap();
        let config = NodeConfig::try_from(args).unwrap();

        assert_eq!(config.id, PeerIdentity::from("10.0.0.1"));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.rate, DEFAULT_RATE);
        assert_eq!(config.retry.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.retry.delay, Duration::from_secs(2));
        assert_eq!(config.peers.len(), 2);
    }

    #[test]
    fn test_self_and_duplicates_are_dropped_from_peers() {
        let args = parse(&["10.0.0.2", "10.0.0.1", "10.0.0.2:4000", "--id", "10.0.0.1"]).unwrap();
        let config = NodeConfig::try_from(args).unwrap();

        let ids: Vec<_> = config.peers.iter().map(|p| p.identity.to_string()).collect();
        assert_eq!(ids, vec!["10.0.0.2"]);
    }

    #[test]
    fn test_invalid_rate_and_peer() {
        let args = parse(&["10.0.0.2", "--id", "a", "--rate", "0"]).unwrap();
        assert!(matches!(NodeConfig::try_from(args), Err(ConfigError::InvalidRate(_))));

        let args = parse(&["10.0.0.2:notaport", "--id", "a"]).unwrap();
        assert!(matches!(NodeConfig::try_from(args), Err(ConfigError::InvalidPeer { .. })));
    }

    #[test]
    fn test_identity_detected_towards_loopback_peer() {
        let args = parse(&["127.0.0.1:4001", "--port", "4002"]).unwrap();
        let config = NodeConfig::try_from(args).unwrap();

        assert_eq!(config.id, PeerIdentity::from("127.0.0.1:4002"));
    }
}
