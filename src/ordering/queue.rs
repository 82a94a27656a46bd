use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::message::Envelope;
use super::peers::PeerIdentity;

/*
    Min-priority queue of envelopes that have not been delivered yet.

    Entries are ordered by (timestamp asc, origin asc), the same total order
    at every node given the same inputs. The insertion sequence only
    separates exact duplicates (a replayed envelope) so neither is lost.

    Alongside the queue sits an index of the timestamps still queued per
    origin, which is all the stability check needs to know about the rest
    of the queue.
*/

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryState {
    Pending,
    Deliverable,
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct EntryKey {
    pub timestamp: u64,
    pub origin: PeerIdentity,
    seq: u64,
}

#[derive(Clone, Debug)]
pub struct DeliveryQueueEntry {
    pub envelope: Envelope,
    pub state: EntryState,
    /// Members already known to have something queued at or after this
    /// entry's timestamp. Only filled while the entry sits at the head.
    pub heard_from: BTreeSet<PeerIdentity>,
}

#[derive(Debug, Default)]
pub struct OriginIndex {
    timestamps: HashMap<PeerIdentity, BTreeMap<u64, usize>>,
}

impl OriginIndex {
    fn insert(&mut self, origin: &PeerIdentity, timestamp: u64) {
        *self
            .timestamps
            .entry(origin.clone())
            .or_default()
            .entry(timestamp)
            .or_insert(0) += 1;
    }

    fn remove(&mut self, origin: &PeerIdentity, timestamp: u64) {
        let Some(stamps) = self.timestamps.get_mut(origin) else {
            return;
        };
        if let Some(count) = stamps.get_mut(&timestamp) {
            *count -= 1;
            if *count == 0 {
                stamps.remove(&timestamp);
            }
        }
        if stamps.is_empty() {
            self.timestamps.remove(origin);
        }
    }

    /// Largest timestamp still queued from `origin`.
    pub fn newest_from(&self, origin: &PeerIdentity) -> Option<u64> {
        self.timestamps
            .get(origin)
            .and_then(|stamps| stamps.last_key_value())
            .map(|(timestamp, _)| *timestamp)
    }
}

#[derive(Debug, Default)]
pub struct DeliveryQueue {
    entries: BTreeMap<EntryKey, DeliveryQueueEntry>,
    by_origin: OriginIndex,
    next_seq: u64,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        DeliveryQueue::default()
    }

    pub fn push(&mut self, envelope: Envelope) {
        let key = EntryKey {
            timestamp: envelope.clock,
            origin: envelope.peer_ip.clone(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.by_origin.insert(&key.origin, key.timestamp);
        self.entries.insert(
            key,
            DeliveryQueueEntry {
                envelope,
                state: EntryState::Pending,
                heard_from: BTreeSet::new(),
            },
        );
    }

    pub fn peek(&self) -> Option<&DeliveryQueueEntry> {
        self.entries.first_key_value().map(|(_, entry)| entry)
    }

    /// Head entry together with the per-origin index, for the stability
    /// check to record evidence on.
    pub fn head_mut(&mut self) -> Option<(&mut DeliveryQueueEntry, &OriginIndex)> {
        let head = self.entries.first_entry()?.into_mut();
        Some((head, &self.by_origin))
    }

    pub fn pop(&mut self) -> Option<DeliveryQueueEntry> {
        let (key, entry) = self.entries.pop_first()?;
        self.by_origin.remove(&key.origin, key.timestamp);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
