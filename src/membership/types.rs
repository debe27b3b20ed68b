use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Cluster-wide identity of a node.
///
/// The same identifier names a node in gossip, in the DSM transport address
/// book, in page-ownership maps and as the holder of a lease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

/// Represents a single member in the cluster.
///
/// Contains identity, the three advertised addresses and the current lifecycle state.
/// The `incarnation` field is a logical clock used to order updates and resolve conflicts
/// (e.g., refuting a false "Suspect" claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub dsm_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// The gossip wire protocol.
///
/// - `Ping/Ack`: Used for liveness checks and state synchronization.
/// - `Join`: Sent by new nodes to seed nodes to enter the cluster.
/// - `Suspect/Alive`: Disseminates changes in node health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: Node,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        node: Node,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },
}

/// Typed notification of a membership change.
///
/// Published on a broadcast channel so failure handling and the transport
/// address book react to liveness without reaching into the member table.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// A node was seen for the first time.
    Joined(Node),
    /// A known node moved between lifecycle states.
    StateChanged {
        node: Node,
        from: NodeState,
        to: NodeState,
    },
    /// A node was removed from the member table.
    Left(NodeId),
}

impl MembershipEvent {
    pub fn node_id(&self) -> &NodeId {
        match self {
            MembershipEvent::Joined(node) => &node.id,
            MembershipEvent::StateChanged { node, .. } => &node.id,
            MembershipEvent::Left(id) => id,
        }
    }

    /// True when the event means the node can no longer hold leases or serve pages.
    pub fn is_departure(&self) -> bool {
        matches!(
            self,
            MembershipEvent::Left(_)
                | MembershipEvent::StateChanged {
                    to: NodeState::Dead,
                    ..
                }
        )
    }
}
