//! HTTP API Module
//!
//! Exposes the node's shared arrays to clients over HTTP/JSON. Every request
//! runs against the local `MemoryManager`; engine errors are mapped to status
//! codes so clients can tell retryable conflicts from permanent failures.

pub mod handlers;
pub mod protocol;

#[cfg(test)]
mod tests;

use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use std::sync::Arc;

use crate::dsm::manager::MemoryManager;
use crate::membership::service::MembershipService;
use handlers::*;
use protocol::*;

pub fn router(manager: Arc<MemoryManager>, membership: Arc<MembershipService>) -> Router {
    Router::new()
        .route(ENDPOINT_ARRAYS, post(handle_create_array))
        .route(
            ENDPOINT_ARRAY,
            get(handle_get_array).delete(handle_delete_array),
        )
        .route(
            ENDPOINT_ELEMENT,
            get(handle_get_element).put(handle_set_element),
        )
        .route(ENDPOINT_SYNC, post(handle_sync))
        .route(ENDPOINT_CLOSE, post(handle_close))
        .route(ENDPOINT_CACHE_STATS, get(handle_cache_stats))
        .route(ENDPOINT_MEMBERS, get(handle_cluster_members))
        .layer(Extension(manager))
        .layer(Extension(membership))
}
