use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::codec::{encode, LineFramer};
use super::PeerAddress;
use crate::common::error::{CodecError, MeshError};
use crate::ordering::message::{Envelope, Event, Kind};
use crate::ordering::peers::PeerIdentity;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_GRACE: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 4096;

/*
    One link per peer identity. A link is Connecting while we dial, Open
    once installed in the table, Closed when its reader sees EOF.

    Handshake: the dialer sends a HELLO line naming itself and waits. The
    acceptor either replies with its own HELLO and installs the link, or
    closes the stream without reading further. The dialer installs the link
    only once the reply arrives, so neither end writes an envelope on a link
    the other end has not taken.

    Duplicates: the link dialed by the lower identity of the pair is the
    preferred one. While the lower peer is dialing it refuses the higher
    peer's inbound link, and it refuses any inbound link while one is
    already open. The higher peer accepts the preferred link even over an
    open one. A link that loses its slot is retired: its write half is
    flushed and shut down and its reader keeps forwarding until EOF.
*/

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            delay: Duration::from_secs(2),
        }
    }
}

struct Link {
    id: u64,
    dialer: PeerIdentity,
    writer: UnboundedSender<String>,
    writer_task: JoinHandle<()>,
    reader: AbortHandle,
}

impl Link {
    fn retire(self) {
        // Dropping the sender lets the writer flush and shut down; the reader
        // is left to drain whatever the peer already sent.
        drop(self.writer);
    }
}

#[derive(Default)]
struct LinkTable {
    open: HashMap<PeerIdentity, Link>,
    dialing: HashSet<PeerIdentity>,
}

/// One side of a link that finished its handshake.
struct Handshaken {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    framer: LineFramer,
    backlog: Vec<Result<Envelope, CodecError>>,
}

struct MeshInner {
    id: PeerIdentity,
    retry: RetryPolicy,
    events: UnboundedSender<Event>,
    links: Mutex<LinkTable>,
    next_link: AtomicU64,
}

#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

impl Mesh {
    pub fn new(id: PeerIdentity, retry: RetryPolicy, events: UnboundedSender<Event>) -> Self {
        Mesh {
            inner: Arc::new(MeshInner {
                id,
                retry,
                events,
                links: Mutex::new(LinkTable::default()),
                next_link: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &PeerIdentity {
        &self.inner.id
    }

    fn table(&self) -> MutexGuard<'_, LinkTable> {
        self.inner.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: Event) {
        if self.inner.events.send(event).is_err() {
            debug!("ordering processor gone, event dropped");
        }
    }

    pub fn link_state(&self, peer: &PeerIdentity) -> LinkState {
        let table = self.table();
        if table.open.contains_key(peer) {
            LinkState::Open
        } else if table.dialing.contains(peer) {
            LinkState::Connecting
        } else {
            LinkState::Closed
        }
    }

    pub fn active_peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<_> = self.table().open.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Dials `peer` until a link to it is open, giving up after the retry
    /// budget. Giving up is reported to the processor as `PeerUnavailable`.
    pub async fn connect(&self, peer: &PeerAddress) -> Result<(), MeshError> {
        let retry = self.inner.retry;
        let mut attempts = 0;
        loop {
            if !self.begin_dial(&peer.identity) {
                return Ok(());
            }
            attempts += 1;

            let result = match TcpStream::connect((peer.host.as_str(), peer.port)).await {
                Ok(stream) => self.open_outbound(peer, stream).await,
                Err(e) => Err(e.into()),
            };
            let refused = result.err();
            let open = self.end_dial(&peer.identity, refused.is_none() || attempts > retry.max_retries);
            match refused {
                None => return Ok(()),
                // The peer refused ours because its own link won.
                Some(_) if open => return Ok(()),
                Some(e) if attempts <= retry.max_retries => {
                    debug!(peer = %peer.identity, attempt = attempts, error = %e, "dial failed, retrying");
                    tokio::time::sleep(retry.delay).await;
                }
                Some(e) => {
                    warn!(peer = %peer.identity, attempts, error = %e, "giving up on peer");
                    self.notify(Event::PeerUnavailable(peer.identity.clone()));
                    return Err(MeshError::Unavailable {
                        peer: peer.identity.clone(),
                        attempts,
                    });
                }
            }
        }
    }

    /// Marks `peer` as being dialed, unless a link to it is already open.
    fn begin_dial(&self, peer: &PeerIdentity) -> bool {
        let mut table = self.table();
        if table.open.contains_key(peer) {
            return false;
        }
        table.dialing.insert(peer.clone());
        true
    }

    /// Reports whether a link to `peer` is open, clearing the dialing mark
    /// when `done` or when that link exists.
    fn end_dial(&self, peer: &PeerIdentity, done: bool) -> bool {
        let mut table = self.table();
        let open = table.open.contains_key(peer);
        if done || open {
            table.dialing.remove(peer);
        }
        open
    }

    async fn open_outbound(&self, peer: &PeerAddress, stream: TcpStream) -> Result<(), MeshError> {
        let addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (mut read, mut write) = stream.into_split();
        let hello = encode(&Envelope::hello(self.inner.id.clone()))?;
        write.write_all(hello.as_bytes()).await?;

        let mut framer = LineFramer::new();
        let (reply, backlog) = handshake(addr, &mut read, &mut framer).await?;
        if reply.peer_ip != peer.identity {
            warn!(
                configured = %peer.identity,
                announced = %reply.peer_ip,
                "peer announces a different identity than it is configured under"
            );
        }

        let side = Handshaken {
            read,
            write,
            framer,
            backlog,
        };
        let mut table = self.table();
        self.install(&mut table, reply.peer_ip, self.inner.id.clone(), side, None);
        Ok(())
    }

    /// Takes an inbound stream through the HELLO handshake. The link is
    /// installed and answered with our HELLO, unless the duplicate rule
    /// refuses it, in which case the stream is dropped.
    pub async fn accept(&self, stream: TcpStream) -> Result<(), MeshError> {
        let addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (mut read, write) = stream.into_split();
        let mut framer = LineFramer::new();

        let (hello, backlog) = handshake(addr, &mut read, &mut framer).await?;
        debug!(peer = %hello.peer_ip, %addr, "inbound handshake complete");
        let reply = encode(&Envelope::hello(self.inner.id.clone()))?;
        let peer = hello.peer_ip;

        let mut table = self.table();
        if !self.admits(&table, &peer) {
            info!(peer = %peer, "duplicate link refused");
            return Ok(());
        }
        let side = Handshaken {
            read,
            write,
            framer,
            backlog,
        };
        self.install(&mut table, peer.clone(), peer, side, Some(reply));
        Ok(())
    }

    /// Whether an inbound link dialed by `peer` may take its slot.
    fn admits(&self, table: &LinkTable, peer: &PeerIdentity) -> bool {
        let peer_preferred = peer < &self.inner.id;
        match table.open.get(peer) {
            Some(existing) => peer_preferred && &existing.dialer != peer,
            None => peer_preferred || !table.dialing.contains(peer),
        }
    }

    fn install(
        &self,
        table: &mut LinkTable,
        peer: PeerIdentity,
        dialer: PeerIdentity,
        side: Handshaken,
        greeting: Option<String>,
    ) {
        let id = self.inner.next_link.fetch_add(1, Ordering::Relaxed);
        let (writer, lines) = mpsc::unbounded_channel();
        // Queued before the link is visible to `broadcast`.
        if let Some(greeting) = greeting {
            let _ = writer.send(greeting);
        }
        let writer_task = tokio::spawn(write_loop(peer.clone(), side.write, lines));
        let reader = tokio::spawn(self.clone().read_loop(peer.clone(), id, side.read, side.framer, side.backlog))
            .abort_handle();

        let link = Link {
            id,
            dialer: dialer.clone(),
            writer,
            writer_task,
            reader,
        };
        if let Some(replaced) = table.open.insert(peer.clone(), link) {
            info!(peer = %peer, dialer = %dialer, "link replaces an existing one");
            replaced.retire();
        }
        self.notify(Event::LinkOpened(peer.clone()));
        info!(peer = %peer, dialer = %dialer, state = ?LinkState::Open, "link installed");
    }

    async fn read_loop(
        self,
        peer: PeerIdentity,
        id: u64,
        mut read: OwnedReadHalf,
        mut framer: LineFramer,
        backlog: Vec<Result<Envelope, CodecError>>,
    ) {
        for frame in backlog {
            self.forward(&peer, frame);
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match read.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for frame in framer.push(&chunk[..n]) {
                        self.forward(&peer, frame);
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "read failed");
                    break;
                }
            }
        }
        self.deregister(&peer, id);
    }

    fn forward(&self, peer: &PeerIdentity, frame: Result<Envelope, CodecError>) {
        match frame {
            Ok(envelope) if envelope.kind() == Kind::Hello => {
                debug!(peer = %peer, "ignoring repeated HELLO");
            }
            Ok(envelope) => self.notify(Event::Received(envelope)),
            Err(e) => warn!(peer = %peer, error = %e, "discarding malformed envelope"),
        }
    }

    fn deregister(&self, peer: &PeerIdentity, id: u64) {
        let removed = {
            let mut table = self.table();
            match table.open.get(peer) {
                Some(link) if link.id == id => table.open.remove(peer),
                _ => None,
            }
        };
        if let Some(link) = removed {
            link.retire();
            info!(peer = %peer, state = ?LinkState::Closed, "link lost");
            self.notify(Event::LinkClosed(peer.clone()));
        }
    }

    /// Sends `envelope` down every open link and back to the local
    /// processor.
    pub fn broadcast(&self, envelope: &Envelope) -> Result<(), MeshError> {
        let line = encode(envelope)?;
        for (peer, link) in self.table().open.iter() {
            if link.writer.send(line.clone()).is_err() {
                debug!(peer = %peer, "writer gone, envelope not sent");
            }
        }
        self.notify(Event::Received(envelope.clone()));
        Ok(())
    }

    /// Broadcasts the SHUTDOWN envelope, then closes every link once its
    /// queued lines are written.
    pub async fn shutdown(&self, envelope: &Envelope) -> Result<(), MeshError> {
        self.broadcast(envelope)?;
        self.close_all().await;
        Ok(())
    }

    pub async fn close_all(&self) {
        let links: Vec<Link> = self.table().open.drain().map(|(_, link)| link).collect();
        if links.is_empty() {
            return;
        }
        info!(links = links.len(), "closing all links");

        let mut writers = Vec::with_capacity(links.len());
        for link in links {
            link.reader.abort();
            drop(link.writer);
            writers.push(link.writer_task);
        }
        for writer in writers {
            if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
                debug!("writer did not finish within the close grace period");
            }
        }
    }

    /// Drains the processor's outbound envelopes. Ends once the processor
    /// drops its sender, closing every link on the way out.
    pub async fn pump(self, mut outbound: UnboundedReceiver<Envelope>) {
        while let Some(envelope) = outbound.recv().await {
            let result = if envelope.kind() == Kind::Shutdown {
                self.shutdown(&envelope).await
            } else {
                self.broadcast(&envelope)
            };
            if let Err(e) = result {
                warn!(error = %e, "broadcast failed");
            }
        }
        self.close_all().await;
    }

    pub async fn listen(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "incoming connection");
                    let mesh = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = mesh.accept(stream).await {
                            warn!(%addr, error = %e, "inbound connection dropped");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
    }
}

/// Reads the HELLO line that opens every link, keeping whatever followed it
/// in the same reads.
async fn handshake(
    addr: SocketAddr,
    read: &mut OwnedReadHalf,
    framer: &mut LineFramer,
) -> Result<(Envelope, Vec<Result<Envelope, CodecError>>), MeshError> {
    let failed = |reason: String| MeshError::Handshake { addr, reason };
    let (hello, backlog) = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_hello(read, framer))
        .await
        .map_err(|_| failed("timed out waiting for HELLO".to_string()))??
        .ok_or_else(|| failed("closed before HELLO".to_string()))?;
    if hello.kind() != Kind::Hello {
        return Err(failed(format!("expected HELLO, got `{}`", hello.text)));
    }
    Ok((hello, backlog))
}

async fn read_hello(
    read: &mut OwnedReadHalf,
    framer: &mut LineFramer,
) -> Result<Option<(Envelope, Vec<Result<Envelope, CodecError>>)>, MeshError> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match read.read(&mut chunk).await {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut frames = framer.push(&chunk[..n]);
        if frames.is_empty() {
            continue;
        }
        let backlog = frames.split_off(1);
        let hello = frames.remove(0)?;
        return Ok(Some((hello, backlog)));
    }
}

async fn write_loop(peer: PeerIdentity, mut write: OwnedWriteHalf, mut lines: UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = write.write_all(line.as_bytes()).await {
            debug!(peer = %peer, error = %e, "write failed");
            break;
        }
    }
    let _ = write.shutdown().await;
}
