use tracing::debug;

use super::peers::{PeerIdentity, Peers};
use super::queue::{DeliveryQueue, EntryState};

/*
    The head of the queue is stable once, for every known member, the queue
    holds some entry from that member stamped at or after the head.

    Each member stamps its sends with strictly increasing clocks and links
    are FIFO, so such an entry means nothing that member sends later can sort
    before the head. This is the round-based "heard from everyone" rule: it
    relies on every member continuing to send (messages or ACKs) and it is
    not a proof against replayed or forged evidence.

    Evidence is recorded on the head entry as it accumulates. While an entry
    stays at the head nothing at or after its timestamp can leave the queue,
    so a member, once confirmed, never needs checking again.
*/

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Readiness {
    Empty,
    Waiting { missing: Vec<PeerIdentity> },
    Deliverable,
}

#[derive(Debug, Clone)]
pub struct StabilityDetector {
    pub peers: Peers,
}

impl StabilityDetector {
    pub fn new(peers: Peers) -> Self {
        StabilityDetector { peers }
    }

    pub fn evaluate(&self, queue: &mut DeliveryQueue) -> Readiness {
        let Some((head, index)) = queue.head_mut() else {
            return Readiness::Empty;
        };
        if head.state == EntryState::Deliverable {
            return Readiness::Deliverable;
        }

        let timestamp = head.envelope.clock;
        let mut missing = Vec::new();
        for member in self.peers.iter() {
            if head.heard_from.contains(member) {
                continue;
            }
            match index.newest_from(member) {
                Some(newest) if newest >= timestamp => {
                    head.heard_from.insert(member.clone());
                }
                _ => missing.push(member.clone()),
            }
        }

        if missing.is_empty() {
            head.state = EntryState::Deliverable;
            Readiness::Deliverable
        } else {
            debug!(
                clock = timestamp,
                origin = %head.envelope.peer_ip,
                waiting_on = missing.len(),
                "head not yet stable"
            );
            Readiness::Waiting { missing }
        }
    }

    /// Drops a member that will never be heard from. Returns whether it was
    /// one.
    pub fn forget(&mut self, peer: &PeerIdentity) -> bool {
        self.peers.remove(peer)
    }

    pub fn is_member(&self, peer: &PeerIdentity) -> bool {
        self.peers.is_member(peer)
    }
}
