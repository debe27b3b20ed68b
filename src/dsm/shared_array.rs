use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::array::Array;
use super::error::DsmResult;
use super::manager::MemoryManager;
use super::storage::Element;
use super::types::{ArrayId, ElementKind, Version};

/// Handle through which a computation reads, writes and synchronizes one array.
///
/// Each handle carries its own cancellation token; `close` cancels calls still
/// in flight before releasing the node's leases.
pub struct SharedArray {
    manager: Arc<MemoryManager>,
    array: Arc<Array>,
    cancel: CancellationToken,
}

impl SharedArray {
    /// Creates a new array homed on the local node.
    pub async fn create(
        manager: Arc<MemoryManager>,
        length: u64,
        element: ElementKind,
    ) -> DsmResult<Self> {
        let array = manager.create_array(length, element).await?;
        Ok(Self::wrap(manager, array))
    }

    /// Opens an array already known to the local node.
    pub fn open(manager: Arc<MemoryManager>, id: &ArrayId) -> DsmResult<Self> {
        let array = manager.get_array(id)?;
        Ok(Self::wrap(manager, array))
    }

    fn wrap(manager: Arc<MemoryManager>, array: Arc<Array>) -> Self {
        let cancel = manager.child_token();
        Self {
            manager,
            array,
            cancel,
        }
    }

    pub fn id(&self) -> &ArrayId {
        &self.array.id
    }

    pub fn len(&self) -> u64 {
        self.array.length
    }

    pub fn is_empty(&self) -> bool {
        self.array.length == 0
    }

    pub fn element_kind(&self) -> ElementKind {
        self.array.element
    }

    pub fn version(&self) -> Version {
        self.array.version()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn get<T: Element>(&self, index: u64) -> DsmResult<T> {
        self.manager
            .get_element(&self.array.id, index, &self.cancel)
            .await
    }

    pub async fn set<T: Element>(&self, index: u64, value: T) -> DsmResult<()> {
        self.manager
            .set_element(&self.array.id, index, value, &self.cancel)
            .await
    }

    pub async fn sync(&self) -> DsmResult<Version> {
        self.manager.sync(&self.array.id, &self.cancel).await
    }

    pub async fn close(&self) -> DsmResult<()> {
        self.cancel.cancel();
        self.manager.close_array(&self.array.id).await
    }
}
