use parking_lot::RwLock;
use std::sync::Arc;

use super::error::DsmResult;
use super::storage::{Element, PageStorage};
use super::types::{PageId, Version};

/// Shared handle to a page held in local storage, the cache or a write buffer.
pub type PageRef = Arc<RwLock<Page>>;

/// A versioned, fixed-size chunk of an array.
#[derive(Debug, Clone)]
pub struct Page {
    pub id: PageId,
    pub version: Version,
    storage: PageStorage,
    dirty: bool,
}

impl Page {
    /// A zero-filled page at version 0.
    pub fn new(id: PageId, size: usize) -> Self {
        Self {
            id,
            version: 0,
            storage: PageStorage::new(size),
            dirty: false,
        }
    }

    pub fn from_bytes(id: PageId, version: Version, bytes: Vec<u8>) -> Self {
        Self {
            id,
            version,
            storage: PageStorage::from_bytes(bytes),
            dirty: false,
        }
    }

    pub fn into_ref(self) -> PageRef {
        Arc::new(RwLock::new(self))
    }

    pub fn size(&self) -> usize {
        self.storage.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.storage.as_bytes().to_vec()
    }

    /// Reads the element stored in `slot`.
    pub fn read<T: Element>(&self, slot: usize) -> DsmResult<T> {
        T::read_from(&self.storage, slot.saturating_mul(T::KIND.width()))
    }

    /// Writes `value` into `slot` and marks the page dirty.
    pub fn write<T: Element>(&mut self, slot: usize, value: T) -> DsmResult<()> {
        value.write_to(&mut self.storage, slot.saturating_mul(T::KIND.width()))?;
        self.dirty = true;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Installs committed bytes, advances the page version and clears the dirty flag.
    pub fn commit(&mut self, bytes: Vec<u8>) -> Version {
        self.storage = PageStorage::from_bytes(bytes);
        self.version += 1;
        self.dirty = false;
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_marks_dirty_and_commit_advances_version() {
        let mut page = Page::new(3, 64);
        assert!(!page.is_dirty());

        page.write::<i64>(2, -9).unwrap();
        assert!(page.is_dirty());
        assert_eq!(page.read::<i64>(2).unwrap(), -9);

        let flushed = page.to_bytes();
        let mut owner = Page::new(3, 64);
        assert_eq!(owner.commit(flushed), 1);
        assert!(!owner.is_dirty());
        assert_eq!(owner.read::<i64>(2).unwrap(), -9);
    }

    #[test]
    fn test_slot_past_the_end_is_rejected() {
        let mut page = Page::new(0, 64);
        assert!(page.write::<i64>(8, 1).is_err());
        assert!(page.read::<f32>(16).is_err());
        assert!(!page.is_dirty());
    }
}
