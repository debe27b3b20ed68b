use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{ArrayId, ElementKind, LeaseId, LeaseType, PageId};
use crate::membership::types::NodeId;
use crate::transport::TransportError;

pub type DsmResult<T> = Result<T, DsmError>;

/// Every failure the coherence engine reports.
///
/// Serializable so a failure on a remote peer reaches the caller as the same variant.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum DsmError {
    #[error("page {array}/{page} is held under a {held} lease by {holder}")]
    Conflict {
        array: ArrayId,
        page: PageId,
        held: LeaseType,
        holder: NodeId,
    },

    #[error("array {0} not found")]
    ArrayNotFound(ArrayId),

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("page {array}/{page} has no owner")]
    NoOwner { array: ArrayId, page: PageId },

    #[error("lease {lease} on page {array}/{page} expired")]
    Expired {
        lease: LeaseId,
        array: ArrayId,
        page: PageId,
    },

    #[error("access of {width} bytes at offset {offset} exceeds page size {size}")]
    OutOfBounds {
        offset: usize,
        width: usize,
        size: usize,
    },

    #[error("index {index} out of bounds for array {array} of length {length}")]
    IndexOutOfBounds {
        array: ArrayId,
        index: u64,
        length: u64,
    },

    #[error("{length} elements of {width} bytes need more than {max_pages} pages of {page_size} bytes")]
    ArrayTooLarge {
        length: u64,
        width: usize,
        page_size: usize,
        max_pages: u32,
    },

    #[error("array {array} holds {expected} elements, not {actual}")]
    ElementMismatch {
        array: ArrayId,
        expected: ElementKind,
        actual: ElementKind,
    },

    #[error("page {array}/{page} is {actual} bytes, expected {expected}")]
    PageSizeMismatch {
        array: ArrayId,
        page: PageId,
        expected: usize,
        actual: usize,
    },

    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: NodeId, reason: String },

    #[error("request to {node} timed out after {after_ms}ms")]
    Timeout { node: NodeId, after_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DsmError {
    pub fn unreachable(node: &NodeId, err: TransportError) -> Self {
        DsmError::Unreachable {
            node: node.clone(),
            reason: err.to_string(),
        }
    }

    /// Failures the caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DsmError::Conflict { .. } | DsmError::Unreachable { .. } | DsmError::Timeout { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DsmError::ArrayNotFound(_) | DsmError::LeaseNotFound(_) | DsmError::NoOwner { .. }
        )
    }
}
