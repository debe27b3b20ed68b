use serde::{Deserialize, Serialize};
use std::fmt;

use crate::membership::types::NodeId;

/// Index of a page within its array.
pub type PageId = u32;

/// Monotonic version counter of arrays and pages.
pub type Version = u64;

/// Globally unique, opaque array identifier generated at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(pub String);

impl ArrayId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ArrayId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArrayId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Addresses one page of one array. The unit of leasing, caching and ownership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub array: ArrayId,
    pub page: PageId,
}

impl PageKey {
    pub fn new(array: ArrayId, page: PageId) -> Self {
        Self { array, page }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.array, self.page)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LeaseId(pub String);

impl LeaseId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LeaseType {
    Read,
    Write,
}

impl fmt::Display for LeaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseType::Read => f.write_str("read"),
            LeaseType::Write => f.write_str("write"),
        }
    }
}

/// Time-bounded grant of read or write access to a single page.
///
/// A lease past `expires_at` is void even while it still sits in the table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub array: ArrayId,
    pub page: PageId,
    pub lease_type: LeaseType,
    pub owner: NodeId,
    /// Timestamp (ms) after which the lease is void.
    pub expires_at: u64,
    /// Array version the lease was issued against.
    pub version: Version,
}

impl Lease {
    pub fn key(&self) -> PageKey {
        PageKey::new(self.array.clone(), self.page)
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }
}

/// Element encodings an array can hold.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ElementKind {
    #[default]
    Int64,
    Float32,
}

impl ElementKind {
    /// Encoded width in bytes.
    pub const fn width(self) -> usize {
        match self {
            ElementKind::Int64 => 8,
            ElementKind::Float32 => 4,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKind::Int64 => f.write_str("int64"),
            ElementKind::Float32 => f.write_str("float32"),
        }
    }
}

/// A dynamically typed element, used where the element type is only known at runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ElementValue {
    Int64(i64),
    Float32(f32),
}

impl ElementValue {
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementValue::Int64(_) => ElementKind::Int64,
            ElementValue::Float32(_) => ElementKind::Float32,
        }
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
