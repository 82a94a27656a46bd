use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::clock::LamportClock;
use super::message::{Envelope, Event, Kind};
use super::peers::{PeerIdentity, Peers};
use super::queue::DeliveryQueue;
use super::stability::{Readiness, StabilityDetector};
use crate::common::error::OrderingError;
use crate::sink::DeliverySink;

/*
    The processor is the only owner of the clock and the delivery queue.
    Link readers, the broadcast driver and the signal handler never touch
    either; they post events to `event_rx` and this loop applies them one at
    a time, so a stability check always sees a queue no insertion is racing.

    Outgoing envelopes go to `msg_tx`. Whoever drains it is expected to send
    them to every peer and back to this processor (loopback), which is how
    the originator runs its own delivery path.
*/

pub struct OrderingProcessor<S> {
    pub id: PeerIdentity,
    pub clock: LamportClock,
    pub queue: DeliveryQueue,
    pub stability: StabilityDetector,
    pub sink: S,
    pub event_rx: UnboundedReceiver<Event>,
    pub msg_tx: UnboundedSender<Envelope>,
    pub halt: watch::Sender<bool>,
    pub delivered: u64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ShutdownCause {
    /// Signal or caller asked this node to stop.
    Local,
    /// A peer broadcast SHUTDOWN.
    Remote(PeerIdentity),
    /// Every event sender went away.
    Disconnected,
}

impl<S: DeliverySink> OrderingProcessor<S> {
    pub fn new(
        id: PeerIdentity,
        peers: Peers,
        sink: S,
        event_rx: UnboundedReceiver<Event>,
        msg_tx: UnboundedSender<Envelope>,
        halt: watch::Sender<bool>,
    ) -> Self {
        OrderingProcessor {
            id,
            clock: LamportClock::new(),
            queue: DeliveryQueue::new(),
            stability: StabilityDetector::new(peers),
            sink,
            event_rx,
            msg_tx,
            halt,
            delivered: 0,
        }
    }

    pub async fn run(&mut self) -> Result<ShutdownCause, OrderingError> {
        info!(id = %self.id, members = self.stability.peers.members.len(), "running ordering processor");
        while let Some(event) = self.event_rx.recv().await {
            if let Some(cause) = self.handle(event)? {
                self.shutdown(&cause);
                return Ok(cause);
            }
        }
        self.halt.send_replace(true);
        Ok(ShutdownCause::Disconnected)
    }

    pub fn handle(&mut self, event: Event) -> Result<Option<ShutdownCause>, OrderingError> {
        match event {
            Event::Received(envelope) => return self.receive(envelope),
            Event::Originate(text) => self.originate(text)?,
            Event::LinkOpened(peer) => {
                if self.stability.is_member(&peer) {
                    info!(peer = %peer, "link open");
                } else {
                    // Its envelopes never count as evidence for any member.
                    warn!(peer = %peer, "link open to a peer outside the membership, check that --id matches how peers name this node");
                }
            }
            Event::LinkClosed(peer) => {
                if self.stability.is_member(&peer) && !self.queue.is_empty() {
                    warn!(
                        peer = %peer,
                        pending = self.queue.len(),
                        "link lost, entries waiting on this peer cannot become deliverable"
                    );
                } else {
                    info!(peer = %peer, "link closed");
                }
            }
            Event::PeerUnavailable(peer) => {
                if self.stability.forget(&peer) {
                    warn!(peer = %peer, "peer unavailable, continuing with reduced membership");
                    self.deliver();
                }
            }
            Event::Shutdown => return Ok(Some(ShutdownCause::Local)),
        }
        Ok(None)
    }

    fn receive(&mut self, envelope: Envelope) -> Result<Option<ShutdownCause>, OrderingError> {
        self.clock.observe(envelope.clock);
        match envelope.kind() {
            Kind::Shutdown => {
                info!(peer = %envelope.peer_ip, "received shutdown");
                return Ok(Some(ShutdownCause::Remote(envelope.peer_ip)));
            }
            Kind::Hello => {
                warn!(peer = %envelope.peer_ip, "handshake envelope outside of a handshake, dropped");
                return Ok(None);
            }
            Kind::Message => {
                let stamp = self.clock.tick();
                self.send(Envelope::ack(stamp, self.id.clone()))?;
            }
            Kind::Ack => {}
        }

        debug!(clock = envelope.clock, origin = %envelope.peer_ip, text = %envelope.text, "queued");
        self.queue.push(envelope);
        self.deliver();
        Ok(None)
    }

    fn originate(&mut self, text: String) -> Result<(), OrderingError> {
        let stamp = self.clock.tick();
        debug!(clock = stamp, text = %text, "originating");
        self.send(Envelope::new(text, stamp, self.id.clone()))
    }

    /// Releases every entry the stability rule allows, head first. ACKs are
    /// consumed without reaching the sink.
    pub fn deliver(&mut self) -> usize {
        let mut count = 0;
        while self.stability.evaluate(&mut self.queue) == Readiness::Deliverable {
            let Some(entry) = self.queue.pop() else {
                break;
            };
            if !entry.envelope.is_application() {
                continue;
            }
            if let Err(e) = self.sink.deliver(&entry.envelope) {
                error!(error = %e, "delivery sink failed");
            }
            self.delivered += 1;
            count += 1;
        }
        count
    }

    fn shutdown(&mut self, cause: &ShutdownCause) {
        let stamp = self.clock.tick();
        if self.msg_tx.send(Envelope::shutdown(stamp, self.id.clone())).is_err() {
            debug!("outbound closed before shutdown could be broadcast");
        }
        self.halt.send_replace(true);
        if !self.queue.is_empty() {
            warn!(pending = self.queue.len(), "shutting down with undelivered entries");
        }
        info!(?cause, delivered = self.delivered, "ordering processor stopped");
    }

    fn send(&self, envelope: Envelope) -> Result<(), OrderingError> {
        self.msg_tx
            .send(envelope)
            .map_err(|_| OrderingError::OutboundClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::sink::ChannelSink;

    fn processor(
        id: &str,
        members: &[&str],
    ) -> (
        OrderingProcessor<Vec<Envelope>>,
        mpsc::UnboundedSender<Event>,
        mpsc::UnboundedReceiver<Envelope>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (halt, _) = watch::channel(false);
        let peers = Peers::new(members.iter().map(|m| PeerIdentity::from(*m)));
        let processor = OrderingProcessor::new(id.into(), peers, Vec::new(), event_rx, msg_tx, halt);
        (processor, event_tx, msg_rx)
    }

    fn received(text: &str, clock: u64, origin: &str) -> Event {
        Event::Received(Envelope::new(text, clock, origin.into()))
    }

    #[test]
    fn test_message_is_acked_with_ticked_clock() {
        let (mut processor, _events, mut outgoing) = processor("10.0.0.1", &["10.0.0.1", "10.0.0.2"]);

        processor.handle(received("Dunk", 4, "10.0.0.2")).unwrap();

        // observe(4) -> 5, then the ACK is stamped 5 and the clock moves on.
        let ack = outgoing.try_recv().unwrap();
        assert_eq!(ack, Envelope::ack(5, "10.0.0.1".into()));
        assert_eq!(processor.clock.now(), 6);
        assert_eq!(processor.queue.len(), 1);
    }

    #[test]
    fn test_ack_is_not_acked() {
        let (mut processor, _events, mut outgoing) = processor("10.0.0.1", &["10.0.0.1", "10.0.0.2"]);

        processor.handle(received("ACK", 4, "10.0.0.2")).unwrap();

        assert!(outgoing.try_recv().is_err());
        assert_eq!(processor.clock.now(), 5);
    }

    #[test]
    fn test_originate_stamps_and_sends() {
        let (mut processor, _events, mut outgoing) = processor("10.0.0.1", &["10.0.0.1"]);

        processor.handle(Event::Originate("Layup".into())).unwrap();
        processor.handle(Event::Originate("Steal".into())).unwrap();

        assert_eq!(outgoing.try_recv().unwrap(), Envelope::new("Layup", 0, "10.0.0.1".into()));
        assert_eq!(outgoing.try_recv().unwrap(), Envelope::new("Steal", 1, "10.0.0.1".into()));
        // Nothing is queued until the loopback copy comes back.
        assert!(processor.queue.is_empty());
    }

    #[test]
    fn test_delivers_in_timestamp_then_origin_order() {
        // Three nodes originate one message each at 1, 2 and 2. Arrival is
        // scrambled across origins but FIFO per origin.
        let (mut processor, _events, _outgoing) =
            processor("10.0.0.1", &["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        processor.handle(received("Bench", 2, "10.0.0.2")).unwrap();
        processor.handle(received("Assist", 2, "10.0.0.1")).unwrap();
        assert!(processor.sink.is_empty());

        processor.handle(received("Block", 1, "10.0.0.3")).unwrap();
        processor.handle(received("ACK", 5, "10.0.0.3")).unwrap();
        processor.handle(received("ACK", 6, "10.0.0.1")).unwrap();
        processor.handle(received("ACK", 6, "10.0.0.2")).unwrap();

        let order: Vec<(u64, String)> = processor
            .sink
            .iter()
            .map(|envelope| (envelope.clock, envelope.peer_ip.to_string()))
            .collect();
        assert_eq!(
            order,
            vec![
                (1, "10.0.0.3".to_string()),
                (2, "10.0.0.1".to_string()),
                (2, "10.0.0.2".to_string()),
            ]
        );
        assert_eq!(processor.delivered, 3);
    }

    #[test]
    fn test_control_envelopes_never_reach_sink() {
        let (mut processor, _events, _outgoing) = processor("a", &["a", "b"]);

        processor.handle(received("ACK", 1, "a")).unwrap();
        processor.handle(received("ACK", 2, "b")).unwrap();
        processor.handle(received("Dunk", 3, "a")).unwrap();
        processor.handle(received("ACK", 4, "b")).unwrap();
        processor.handle(received("ACK", 5, "a")).unwrap();

        assert_eq!(processor.sink, vec![Envelope::new("Dunk", 3, "a".into())]);
    }

    #[test]
    fn test_peer_unavailable_unblocks_head() {
        let (mut processor, _events, _outgoing) = processor("a", &["a", "b", "c"]);

        processor.handle(received("Rebound", 1, "a")).unwrap();
        processor.handle(received("ACK", 2, "b")).unwrap();
        assert!(processor.sink.is_empty());

        processor.handle(Event::PeerUnavailable("c".into())).unwrap();
        assert_eq!(processor.sink.len(), 1);
    }

    #[test]
    fn test_link_closed_keeps_membership() {
        let (mut processor, _events, _outgoing) = processor("a", &["a", "b"]);

        processor.handle(received("Rebound", 1, "a")).unwrap();
        processor.handle(Event::LinkClosed("b".into())).unwrap();

        assert!(processor.stability.is_member(&"b".into()));
        assert_eq!(processor.queue.len(), 1);
    }

    #[test]
    fn test_outsider_link_gives_no_evidence() {
        // Arrange: "b" is configured by hostname but announces its address
        let (mut processor, _events, _outgoing) = processor("a", &["a", "peer-b"]);
        processor.handle(received("Rebound", 1, "a")).unwrap();

        // Act
        processor.handle(Event::LinkOpened("10.0.0.2".into())).unwrap();
        processor.handle(received("Steal", 5, "10.0.0.2")).unwrap();

        // Assert: the head still waits on the configured name
        assert!(!processor.stability.is_member(&"10.0.0.2".into()));
        assert!(processor.sink.is_empty());
        assert_eq!(processor.queue.len(), 2);
    }

    #[tokio::test]
    async fn test_silent_peer_starves_queue() {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (msg_tx, _msg_rx) = mpsc::unbounded_channel();
        let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
        let (halt, _) = watch::channel(false);
        let peers = Peers::new(vec!["a".into(), "b".into(), "c".into()]);
        let mut processor =
            OrderingProcessor::new("a".into(), peers, ChannelSink(delivered_tx), event_rx, msg_tx, halt);

        let task = tokio::spawn(async move {
            let cause = processor.run().await;
            (processor, cause)
        });

        // "c" is partitioned away and never says anything.
        for round in 0..5u64 {
            event_tx.send(received("Traveling", round * 10 + 1, "a")).unwrap();
            event_tx.send(received("ACK", round * 10 + 2, "a")).unwrap();
            event_tx.send(received("ACK", round * 10 + 2, "b")).unwrap();
        }

        let waited = tokio::time::timeout(Duration::from_millis(200), delivered_rx.recv()).await;
        assert!(waited.is_err(), "nothing should be deliverable without c");

        event_tx.send(Event::Shutdown).unwrap();
        let (processor, cause) = task.await.unwrap();
        assert_eq!(cause.unwrap(), ShutdownCause::Local);
        assert_eq!(processor.queue.len(), 15);
        assert_eq!(processor.delivered, 0);
    }

    #[tokio::test]
    async fn test_local_shutdown_broadcasts_and_halts() {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        let (halt, mut halted) = watch::channel(false);
        let mut processor =
            OrderingProcessor::new("a".into(), Peers::new(vec!["a".into()]), Vec::new(), event_rx, msg_tx, halt);

        event_tx.send(Event::Shutdown).unwrap();
        let cause = processor.run().await.unwrap();

        assert_eq!(cause, ShutdownCause::Local);
        assert_eq!(msg_rx.recv().await.unwrap(), Envelope::shutdown(0, "a".into()));
        assert!(*halted.borrow_and_update());
    }

    #[tokio::test]
    async fn test_remote_shutdown_is_rebroadcast() {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        let (halt, halted) = watch::channel(false);
        let mut processor = OrderingProcessor::new(
            "a".into(),
            Peers::new(vec!["a".into(), "b".into()]),
            Vec::new(),
            event_rx,
            msg_tx,
            halt,
        );

        event_tx.send(received("SHUTDOWN", 9, "b")).unwrap();
        let cause = processor.run().await.unwrap();

        assert_eq!(cause, ShutdownCause::Remote("b".into()));
        let rebroadcast = msg_rx.recv().await.unwrap();
        assert_eq!(rebroadcast.kind(), Kind::Shutdown);
        assert_eq!(rebroadcast.clock, 10);
        assert!(*halted.borrow());
        assert!(processor.queue.is_empty());
    }
}
