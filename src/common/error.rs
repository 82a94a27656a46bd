use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::ordering::peers::PeerIdentity;

/// Failures turning a line of bytes into an envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong { len: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("peer {peer} unavailable after {attempts} attempts")]
    Unavailable { peer: PeerIdentity, attempts: u32 },
    #[error("handshake with {addr} failed: {reason}")]
    Handshake { addr: SocketAddr, reason: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write delivery log: {0}")]
    Io(#[from] io::Error),
    #[error("delivery receiver dropped")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid peer address `{addr}`: {reason}")]
    InvalidPeer { addr: String, reason: String },
    #[error("origination rate must be a positive number, got {0}")]
    InvalidRate(f64),
    #[error("could not determine a local address, pass --id")]
    NoLocalAddress,
}

#[derive(Debug, Error)]
pub enum OrderingError {
    #[error("outbound channel closed")]
    OutboundClosed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Ordering(#[from] OrderingError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
