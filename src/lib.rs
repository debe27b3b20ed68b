//! Distributed Shared Memory Cluster Library
//!
//! This library crate defines the modules that make up a node of the
//! shared-memory cluster. It serves as the foundation for the binary
//! executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`api`**: HTTP/JSON surface over the node's shared arrays (axum).
//! - **`config`**: Engine tunables and command-line parsing.
//! - **`dsm`**: The coherence engine. Leases, the 2Q page cache, paged arrays,
//!   the Memory Manager and the Sync barrier.
//! - **`membership`**: The cluster coordination layer. Uses a UDP-based Gossip protocol
//!   (SWIM-like) to manage node discovery and failure detection, and publishes
//!   membership events consumed by the DSM failure handler.
//! - **`transport`**: Framed, multiplexed node-to-node streams carrying the DSM
//!   wire protocol, over TCP or an in-process network.

pub mod api;
pub mod config;
pub mod dsm;
pub mod membership;
pub mod transport;
