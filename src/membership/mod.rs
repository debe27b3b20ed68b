//! Membership & Discovery Module
//!
//! SWIM-style gossip over UDP that tells every node who else is in the
//! cluster and where to reach its DSM transport and HTTP API.
//!
//! ## Core Mechanisms
//! - **Gossip**: periodic Ping/Ack exchanges carry each node's view of the member table.
//! - **Failure Detection**: silent nodes move Alive -> Suspect -> Dead, and are reaped later.
//! - **Incarnation Numbers**: a suspected node refutes the suspicion by re-announcing itself
//!   with a higher incarnation.
//! - **Events**: discoveries, state transitions and removals are published as
//!   `MembershipEvent`s. The transport keeps its address book current from them, and the
//!   DSM failure handler revokes leases and forgets page owners of departed nodes.

pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
