//! Transport Module
//!
//! The coherence engine talks to peers only through the small capability
//! interface defined here: a `Transport` dials a `Connection` by node id, a
//! connection opens bidirectional `Stream`s, and a stream reads and writes
//! whole messages. Inbound streams are handed to a `MessageHandler`.
//!
//! ## Implementations
//! - **`tcp`**: one TCP connection per stream, length-framed messages, address book fed by membership.
//! - **`memory`**: in-process channels for deterministic multi-node tests.
//!
//! Every exchange is one request message followed by one response message.

pub mod frame;
pub mod memory;
pub mod tcp;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::membership::types::NodeId;

/// Logical channel a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Lease, invalidation and array-lifecycle messages.
    Control,
    /// Page fetches and page pushes.
    Data,
}

impl StreamKind {
    pub fn as_byte(self) -> u8 {
        match self {
            StreamKind::Control => 0,
            StreamKind::Data => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, TransportError> {
        match byte {
            0 => Ok(StreamKind::Control),
            1 => Ok(StreamKind::Data),
            other => Err(TransportError::Protocol(format!(
                "unknown stream kind {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no route to node {0}")]
    UnknownPeer(NodeId),

    #[error("connection to {node} failed: {reason}")]
    ConnectFailed { node: NodeId, reason: String },

    #[error("stream closed by peer")]
    Closed,

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bidirectional, message-oriented stream.
#[async_trait]
pub trait Stream: Send {
    async fn read_message(&mut self) -> Result<Vec<u8>, TransportError>;

    async fn write_message(&mut self, data: &[u8]) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A connection to one remote node.
#[async_trait]
pub trait Connection: Send + Sync {
    fn node_id(&self) -> &NodeId;

    async fn open_stream(&self, kind: StreamKind) -> Result<Box<dyn Stream>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Dials peers by node id.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_node(&self) -> &NodeId;

    async fn connect(&self, node: &NodeId) -> Result<Arc<dyn Connection>, TransportError>;

    /// Nodes currently reachable through this transport, excluding the local node.
    fn peers(&self) -> Vec<NodeId>;
}

/// Serves one inbound request message and produces the response message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, kind: StreamKind, data: Vec<u8>) -> Vec<u8>;
}

/// Runs the one-request/one-response exchange on an accepted stream.
pub async fn serve_stream(
    mut stream: Box<dyn Stream>,
    kind: StreamKind,
    handler: Arc<dyn MessageHandler>,
) -> Result<(), TransportError> {
    let request = stream.read_message().await?;
    let response = handler.handle_message(kind, request).await;
    stream.write_message(&response).await?;
    stream.close().await
}
