//! TCP implementation of the transport capabilities.
//!
//! A stream is a dedicated TCP connection: the opener writes one byte naming
//! the `StreamKind`, then both sides exchange length-delimited frames. The
//! address book maps node ids to DSM listener addresses and follows
//! membership events.

use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use super::frame::{read_frame, write_frame};
use super::{Connection, MessageHandler, Stream, StreamKind, Transport, TransportError, serve_stream};
use crate::membership::types::{MembershipEvent, NodeId, NodeState};

pub struct TcpTransport {
    local: NodeId,
    addresses: DashMap<NodeId, SocketAddr>,
}

impl TcpTransport {
    pub fn new(local: NodeId) -> Arc<Self> {
        Arc::new(Self {
            local,
            addresses: DashMap::new(),
        })
    }

    pub fn add_peer(&self, node: NodeId, addr: SocketAddr) {
        if node == self.local {
            return;
        }
        if self.addresses.insert(node.clone(), addr) != Some(addr) {
            tracing::debug!("Transport route {:?} -> {}", node, addr);
        }
    }

    pub fn remove_peer(&self, node: &NodeId) {
        if self.addresses.remove(node).is_some() {
            tracing::debug!("Transport route to {:?} removed", node);
        }
    }

    /// Accepts inbound streams forever, serving each on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, handler: Arc<dyn MessageHandler>) {
        tracing::info!(
            "DSM transport listening on {:?}",
            listener.local_addr().ok()
        );

        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::serve_connection(socket, handler).await {
                            tracing::warn!("Stream from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept DSM connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn serve_connection(
        mut socket: TcpStream,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        let kind = StreamKind::from_byte(socket.read_u8().await?)?;
        socket.set_nodelay(true)?;
        serve_stream(Box::new(TcpMessageStream { socket }), kind, handler).await
    }

    /// Keeps the address book in step with membership.
    pub async fn track_membership(self: Arc<Self>, mut events: broadcast::Receiver<MembershipEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.apply_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Transport missed {} membership events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub fn apply_event(&self, event: &MembershipEvent) {
        match event {
            MembershipEvent::Joined(node) => self.add_peer(node.id.clone(), node.dsm_addr),
            MembershipEvent::StateChanged { node, to, .. } => match to {
                NodeState::Alive | NodeState::Suspect => {
                    self.add_peer(node.id.clone(), node.dsm_addr)
                }
                NodeState::Dead => self.remove_peer(&node.id),
            },
            MembershipEvent::Left(id) => self.remove_peer(id),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    async fn connect(&self, node: &NodeId) -> Result<Arc<dyn Connection>, TransportError> {
        let addr = self
            .addresses
            .get(node)
            .map(|entry| *entry.value())
            .ok_or_else(|| TransportError::UnknownPeer(node.clone()))?;

        Ok(Arc::new(TcpConnection {
            node: node.clone(),
            addr,
        }))
    }

    fn peers(&self) -> Vec<NodeId> {
        self.addresses.iter().map(|entry| entry.key().clone()).collect()
    }
}

struct TcpConnection {
    node: NodeId,
    addr: SocketAddr,
}

#[async_trait]
impl Connection for TcpConnection {
    fn node_id(&self) -> &NodeId {
        &self.node
    }

    async fn open_stream(&self, kind: StreamKind) -> Result<Box<dyn Stream>, TransportError> {
        let mut socket = TcpStream::connect(self.addr).await.map_err(|e| {
            TransportError::ConnectFailed {
                node: self.node.clone(),
                reason: e.to_string(),
            }
        })?;
        socket.set_nodelay(true)?;
        socket.write_u8(kind.as_byte()).await?;
        Ok(Box::new(TcpMessageStream { socket }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Streams own their sockets; nothing is pooled per connection.
        Ok(())
    }
}

struct TcpMessageStream {
    socket: TcpStream,
}

#[async_trait]
impl Stream for TcpMessageStream {
    async fn read_message(&mut self) -> Result<Vec<u8>, TransportError> {
        read_frame(&mut self.socket).await
    }

    async fn write_message(&mut self, data: &[u8]) -> Result<(), TransportError> {
        write_frame(&mut self.socket, data).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.socket.shutdown().await?;
        Ok(())
    }
}
