use serde::{Deserialize, Serialize};

use super::peers::PeerIdentity;

/*
    Every envelope carries the sender's Lamport timestamp and identity.
    Application payloads are free text; a handful of texts are reserved for
    control traffic and never reach the application:

      ACK       evidence that the sender has seen everything up to its clock
      SHUTDOWN  the sender is leaving, receivers wind down as well
      HELLO     first line on a freshly dialed link, names the dialer
*/

pub const ACK: &str = "ACK";
pub const SHUTDOWN: &str = "SHUTDOWN";
pub const HELLO: &str = "HELLO";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Message,
    Ack,
    Shutdown,
    Hello,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub text: String,
    pub clock: u64,
    #[serde(rename = "peerIp")]
    pub peer_ip: PeerIdentity,
}

impl Envelope {
    pub fn new(text: impl Into<String>, clock: u64, peer_ip: PeerIdentity) -> Self {
        Envelope {
            text: text.into(),
            clock,
            peer_ip,
        }
    }

    pub fn ack(clock: u64, peer_ip: PeerIdentity) -> Self {
        Envelope::new(ACK, clock, peer_ip)
    }

    pub fn shutdown(clock: u64, peer_ip: PeerIdentity) -> Self {
        Envelope::new(SHUTDOWN, clock, peer_ip)
    }

    pub fn hello(peer_ip: PeerIdentity) -> Self {
        Envelope::new(HELLO, 0, peer_ip)
    }

    pub fn kind(&self) -> Kind {
        match self.text.as_str() {
            ACK => Kind::Ack,
            SHUTDOWN => Kind::Shutdown,
            HELLO => Kind::Hello,
            _ => Kind::Message,
        }
    }

    pub fn is_application(&self) -> bool {
        self.kind() == Kind::Message
    }
}

/// Everything the ordering processor reacts to. Link readers, the driver and
/// the signal handler all feed one channel of these.
#[derive(Clone, Debug)]
pub enum Event {
    Received(Envelope),
    Originate(String),
    LinkOpened(PeerIdentity),
    LinkClosed(PeerIdentity),
    PeerUnavailable(PeerIdentity),
    Shutdown,
}
