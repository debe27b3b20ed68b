//! In-process transport used to run several engines inside one test.
//!
//! Nodes attach to a shared `MemoryNetwork`; opening a stream hands the peer
//! end to the target's listener over a channel. `disconnect` detaches a node
//! so every exchange with it fails the way a crashed host would.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Connection, MessageHandler, Stream, StreamKind, Transport, TransportError, serve_stream};
use crate::membership::types::NodeId;

type Inbound = (StreamKind, MemoryStream);

#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<NodeId, mpsc::UnboundedSender<Inbound>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a node and returns its transport plus the listener for inbound streams.
    pub fn attach(self: &Arc<Self>, node: NodeId) -> (Arc<MemoryTransport>, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.insert(node.clone(), tx);
        let transport = Arc::new(MemoryTransport {
            local: node,
            network: self.clone(),
        });
        (transport, MemoryListener { inbound: rx })
    }

    pub fn disconnect(&self, node: &NodeId) {
        self.nodes.remove(node);
    }

    pub fn is_attached(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }
}

pub struct MemoryListener {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl MemoryListener {
    /// Spawns the accept loop; it ends when the node is disconnected.
    pub fn serve(mut self, handler: Arc<dyn MessageHandler>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((kind, stream)) = self.inbound.recv().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_stream(Box::new(stream), kind, handler).await {
                        tracing::debug!("In-memory stream failed: {}", e);
                    }
                });
            }
        })
    }
}

pub struct MemoryTransport {
    local: NodeId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    async fn connect(&self, node: &NodeId) -> Result<Arc<dyn Connection>, TransportError> {
        if !self.network.is_attached(&self.local) {
            return Err(TransportError::ConnectFailed {
                node: node.clone(),
                reason: "local node is disconnected".to_string(),
            });
        }
        if !self.network.is_attached(node) {
            return Err(TransportError::UnknownPeer(node.clone()));
        }
        Ok(Arc::new(MemoryConnection {
            node: node.clone(),
            network: self.network.clone(),
        }))
    }

    fn peers(&self) -> Vec<NodeId> {
        self.network
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| id != &self.local)
            .collect()
    }
}

struct MemoryConnection {
    node: NodeId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn node_id(&self) -> &NodeId {
        &self.node
    }

    async fn open_stream(&self, kind: StreamKind) -> Result<Box<dyn Stream>, TransportError> {
        let sender = self
            .network
            .nodes
            .get(&self.node)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::UnknownPeer(self.node.clone()))?;

        let (local, remote) = MemoryStream::pair();
        sender
            .send((kind, remote))
            .map_err(|_| TransportError::ConnectFailed {
                node: self.node.clone(),
                reason: "listener stopped".to_string(),
            })?;
        Ok(Box::new(local))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct MemoryStream {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryStream {
    fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: b_rx },
            Self { tx: b_tx, rx: a_rx },
        )
    }
}

#[async_trait]
impl Stream for MemoryStream {
    async fn read_message(&mut self) -> Result<Vec<u8>, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn write_message(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.rx.close();
        Ok(())
    }
}
