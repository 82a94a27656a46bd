use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{info, warn};

use super::mesh::Mesh;
use crate::common::error::{Error, OrderingError};
use crate::config::NodeConfig;
use crate::ordering::driver::BroadcastDriver;
use crate::ordering::message::Event;
use crate::ordering::peers::{PeerIdentity, Peers};
use crate::ordering::processor::{OrderingProcessor, ShutdownCause};
use crate::sink::DeliverySink;

pub struct Node<S> {
    pub config: NodeConfig,
    pub sink: S,
}

/// A started node. Post `Event::Shutdown` through `events` to stop it.
pub struct RunningNode {
    pub id: PeerIdentity,
    pub events: UnboundedSender<Event>,
    pub mesh: Mesh,
    processor: JoinHandle<Result<ShutdownCause, OrderingError>>,
    pump: JoinHandle<()>,
    background: Vec<AbortHandle>,
}

impl<S: DeliverySink + Send + 'static> Node<S> {
    pub fn new(config: NodeConfig, sink: S) -> Self {
        Node { config, sink }
    }

    pub async fn bind(self) -> Result<RunningNode, Error> {
        let listener = TcpListener::bind((self.config.bind, self.config.port)).await?;
        info!(addr = %listener.local_addr()?, "listening");
        Ok(self.start(listener))
    }

    /// Starts every task of the node on an already bound listener: accept
    /// loop, ordering processor, outbound pump, then the dials, and once
    /// those settle, the broadcast driver.
    pub fn start(self, listener: TcpListener) -> RunningNode {
        let Node { config, sink } = self;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (halt_tx, halt_rx) = watch::channel(false);

        let mesh = Mesh::new(config.id.clone(), config.retry, event_tx.clone());
        let listen = tokio::spawn(mesh.clone().listen(listener)).abort_handle();

        let members = Peers::new(
            config
                .peers
                .iter()
                .map(|peer| peer.identity.clone())
                .chain(std::iter::once(config.id.clone())),
        );
        let mut processor = OrderingProcessor::new(config.id.clone(), members, sink, event_rx, msg_tx, halt_tx);
        let processor = tokio::spawn(async move { processor.run().await });
        let pump = tokio::spawn(mesh.clone().pump(msg_rx));

        let dialer = mesh.clone();
        let driver = BroadcastDriver::new(config.rate, event_tx.clone(), halt_rx);
        let peers = config.peers.clone();
        let connect = tokio::spawn(async move {
            let mut dials = JoinSet::new();
            for peer in peers {
                let mesh = dialer.clone();
                dials.spawn(async move { mesh.connect(&peer).await });
            }
            while let Some(result) = dials.join_next().await {
                if let Ok(Err(e)) = result {
                    warn!(error = %e, "continuing without peer");
                }
            }
            info!(links = dialer.active_peers().len(), "initial dials settled, starting driver");
            driver.run().await;
        })
        .abort_handle();

        RunningNode {
            id: config.id,
            events: event_tx,
            mesh,
            processor,
            pump,
            background: vec![listen, connect],
        }
    }
}

impl RunningNode {
    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
    }

    /// Waits for the processor to stop, lets the pump flush and close the
    /// links, then tears down the listener and driver.
    pub async fn wait(self) -> Result<ShutdownCause, Error> {
        let cause = self.processor.await?;
        self.pump.await?;
        for task in self.background {
            task.abort();
        }
        let cause = cause?;
        info!(id = %self.id, ?cause, "node stopped");
        Ok(cause)
    }
}
