//! HTTP API Protocol
//!
//! Route paths and the JSON Data Transfer Objects exchanged with clients of
//! the shared-memory API.

use serde::{Deserialize, Serialize};

use crate::dsm::array::{Array, SyncPhase};
use crate::dsm::types::{ArrayId, ElementKind, ElementValue, Version};
use crate::membership::types::NodeId;

// --- API Endpoints ---

pub const ENDPOINT_ARRAYS: &str = "/arrays";
pub const ENDPOINT_ARRAY: &str = "/arrays/:id";
pub const ENDPOINT_ELEMENT: &str = "/arrays/:id/elements/:index";
pub const ENDPOINT_SYNC: &str = "/arrays/:id/sync";
pub const ENDPOINT_CLOSE: &str = "/arrays/:id/close";
pub const ENDPOINT_CACHE_STATS: &str = "/cache/stats";
pub const ENDPOINT_MEMBERS: &str = "/cluster/members";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateArrayRequest {
    pub length: u64,
    /// Defaults to `Int64` when omitted.
    #[serde(default)]
    pub element: ElementKind,
}

/// Public view of an array's metadata on the answering node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArrayInfo {
    pub id: ArrayId,
    pub length: u64,
    pub element: ElementKind,
    pub page_size: usize,
    pub num_pages: u32,
    pub home: NodeId,
    pub version: Version,
    pub phase: SyncPhase,
}

impl From<&Array> for ArrayInfo {
    fn from(array: &Array) -> Self {
        Self {
            id: array.id.clone(),
            length: array.length,
            element: array.element,
            page_size: array.page_size,
            num_pages: array.num_pages,
            home: array.home.clone(),
            version: array.version(),
            phase: array.phase(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ElementResponse {
    pub array: ArrayId,
    pub index: u64,
    pub value: ElementValue,
}

/// A bare JSON number: integers are accepted for float arrays too.
#[derive(Debug, Serialize, Deserialize)]
pub struct SetElementRequest {
    pub value: ElementValue,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncResponse {
    pub array: ArrayId,
    pub version: Version,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Whether the same request may succeed if reissued later.
    pub retryable: bool,
}
