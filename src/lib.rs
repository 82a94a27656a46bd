/*
    Total Order Multicast over a mesh of symmetric peers.

    Every peer keeps a Lamport clock and stamps each envelope it sends with
    it. Envelopes, including the sender's own copy, land in a priority queue
    ordered by (timestamp, origin), and every application message received
    is answered by an ACK to everyone. The head of the queue is handed to the
    application once every member has been heard from at or after its
    timestamp, at which point nothing that sorts before it can still arrive.
    Since every peer orders by the same key and applies the same rule, every
    peer delivers the same messages in the same order.

    Membership is fixed at startup. A peer that goes silent stalls delivery
    for everyone; only a peer that could never be reached at startup is
    dropped from the set that must be heard from.
*/

pub mod common;
pub mod config;
pub mod network;
pub mod ordering;
pub mod sink;

pub use common::error::{Error, Result};
