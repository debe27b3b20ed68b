//! Distributed Shared Memory Module
//!
//! Presents arrays whose fixed-size pages are spread over the cluster and kept
//! coherent with leases under a single-writer/multi-reader discipline.
//!
//! ## Components
//! - **Storage / Page / Array**: little-endian element encoding, versioned pages, page-ownership maps.
//! - **Lease Manager**: grants, validates, revokes and expires read/write leases per page.
//! - **Page Cache**: bounded 2Q cache of pages fetched from remote owners.
//! - **Memory Manager**: array lifecycle, ownership resolution, local page storage, remote fetches.
//! - **Sync**: the barrier that flushes buffered writes, releases leases, invalidates
//!   stale copies cluster-wide and bumps the array version.
//! - **Failure Handler**: reacts to membership departures by revoking leases and forgetting owners.
//!
//! Each array has a *home* node (its creator). The home's lease table and
//! ownership map are authoritative; other nodes reach them over control streams.

pub mod array;
pub mod cache;
pub mod error;
pub mod failure;
pub mod lease;
pub mod manager;
pub mod page;
pub mod protocol;
pub mod service;
pub mod shared_array;
pub mod storage;
pub mod sync;
pub mod types;
