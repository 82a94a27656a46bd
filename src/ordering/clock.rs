/*
    A Lamport clock is a scalar logical clock satisfying the happens-before
    rule: every process increments its counter before each send, and on
    receipt of a message timestamped t sets its counter to max(local, t) + 1.
    If a causally precedes b then C(a) < C(b). The converse does not hold,
    which is why ties are broken by origin when building a total order.
*/

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct LamportClock {
    value: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        LamportClock { value: 0 }
    }

    pub fn starting_at(value: u64) -> Self {
        LamportClock { value }
    }

    /// Stamp for an outgoing envelope: returns the current value, then
    /// advances by one.
    pub fn tick(&mut self) -> u64 {
        let stamp = self.value;
        self.value += 1;
        stamp
    }

    /// Merge a remote timestamp on receipt.
    pub fn observe(&mut self, remote: u64) -> u64 {
        self.value = self.value.max(remote) + 1;
        self.value
    }

    pub fn now(&self) -> u64 {
        self.value
    }
}
