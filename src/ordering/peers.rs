use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable address naming a mesh member. Identities compare as strings, which
/// is the tie-break between envelopes carrying the same timestamp.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        PeerIdentity(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(id: &str) -> Self {
        PeerIdentity::new(id)
    }
}

impl From<String> for PeerIdentity {
    fn from(id: String) -> Self {
        PeerIdentity(id)
    }
}

/// Members whose evidence the stability rule waits for. Fixed at startup,
/// shrinking only when a peer is declared unavailable.
#[derive(Debug, Clone, Default)]
pub struct Peers {
    pub members: BTreeSet<PeerIdentity>,
}

impl Peers {
    pub fn new(members: impl IntoIterator<Item = PeerIdentity>) -> Self {
        Peers {
            members: members.into_iter().collect(),
        }
    }

    pub fn is_member(&self, peer: &PeerIdentity) -> bool {
        self.members.contains(peer)
    }

    pub fn remove(&mut self, peer: &PeerIdentity) -> bool {
        self.members.remove(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerIdentity> {
        self.members.iter()
    }
}
