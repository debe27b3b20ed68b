use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{DsmError, DsmResult};
use super::types::{ArrayId, ElementKind, LeaseId, PageId, Version};
use crate::membership::types::NodeId;

/// Barrier state of an array on this node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncPhase {
    Active,
    Flushing,
    Invalidating,
    Synced,
}

/// Number of pages needed for `length` elements of `width` bytes, rounded up.
/// Fails when the count does not fit a `PageId`.
pub fn page_count(length: u64, width: usize, page_size: usize) -> DsmResult<u32> {
    let page_size = page_size.max(1);
    let too_large = || DsmError::ArrayTooLarge {
        length,
        width,
        page_size,
        max_pages: PageId::MAX,
    };
    let bytes = length.checked_mul(width as u64).ok_or_else(too_large)?;
    PageId::try_from(bytes.div_ceil(page_size as u64)).map_err(|_| too_large())
}

/// Serializable form of an array, exchanged when arrays are announced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArrayDescriptor {
    pub id: ArrayId,
    pub length: u64,
    pub element: ElementKind,
    pub page_size: usize,
    pub num_pages: u32,
    pub home: NodeId,
    pub version: Version,
    pub owners: Vec<(PageId, NodeId)>,
}

/// An ordered collection of pages with an ownership map and a version.
///
/// The version is advanced only by a completed Sync. A page is either
/// unowned or owned by exactly one node.
#[derive(Debug)]
pub struct Array {
    pub id: ArrayId,
    pub length: u64,
    pub element: ElementKind,
    pub page_size: usize,
    pub num_pages: u32,
    /// Node whose lease table and ownership map are authoritative.
    pub home: NodeId,
    owners: RwLock<HashMap<PageId, NodeId>>,
    /// Write leases that made their holder the owner of a previously unowned
    /// page, one entry per page at most.
    claims: Mutex<HashMap<PageId, LeaseId>>,
    version: AtomicU64,
    phase: Mutex<SyncPhase>,
    /// Pages written on this node since the last completed Sync.
    touched: Mutex<HashSet<PageId>>,
    /// Serializes Sync calls for this array on this node.
    pub(crate) sync_lock: tokio::sync::Mutex<()>,
}

impl Array {
    pub fn new(
        length: u64,
        element: ElementKind,
        page_size: usize,
        home: NodeId,
    ) -> DsmResult<Self> {
        Self::with_id(ArrayId::new(), length, element, page_size, home)
    }

    pub fn with_id(
        id: ArrayId,
        length: u64,
        element: ElementKind,
        page_size: usize,
        home: NodeId,
    ) -> DsmResult<Self> {
        Ok(Self {
            id,
            length,
            element,
            page_size,
            num_pages: page_count(length, element.width(), page_size)?,
            home,
            owners: RwLock::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            version: AtomicU64::new(1),
            phase: Mutex::new(SyncPhase::Active),
            touched: Mutex::new(HashSet::new()),
            sync_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Rebuilds an announced array. The page count is recomputed and must
    /// agree with the announced one.
    pub fn from_descriptor(descriptor: ArrayDescriptor) -> DsmResult<Self> {
        let array = Self::with_id(
            descriptor.id,
            descriptor.length,
            descriptor.element,
            descriptor.page_size,
            descriptor.home,
        )?;
        if array.num_pages != descriptor.num_pages {
            return Err(DsmError::Protocol(format!(
                "array {} announced with {} pages, its length needs {}",
                array.id, descriptor.num_pages, array.num_pages
            )));
        }
        array.version.store(descriptor.version, Ordering::SeqCst);
        array.owners.write().extend(descriptor.owners);
        Ok(array)
    }

    pub fn descriptor(&self) -> ArrayDescriptor {
        let mut owners: Vec<(PageId, NodeId)> = self
            .owners
            .read()
            .iter()
            .map(|(page, node)| (*page, node.clone()))
            .collect();
        owners.sort_by_key(|(page, _)| *page);

        ArrayDescriptor {
            id: self.id.clone(),
            length: self.length,
            element: self.element,
            page_size: self.page_size,
            num_pages: self.num_pages,
            home: self.home.clone(),
            version: self.version(),
            owners,
        }
    }

    pub fn elements_per_page(&self) -> u64 {
        (self.page_size / self.element.width()).max(1) as u64
    }

    /// Maps an element index to its page and slot within the page.
    pub fn locate(&self, index: u64) -> DsmResult<(PageId, usize)> {
        if index >= self.length {
            return Err(DsmError::IndexOutOfBounds {
                array: self.id.clone(),
                index,
                length: self.length,
            });
        }
        let per_page = self.elements_per_page();
        let page = PageId::try_from(index / per_page).map_err(|_| DsmError::IndexOutOfBounds {
            array: self.id.clone(),
            index,
            length: self.length,
        })?;
        Ok((page, (index % per_page) as usize))
    }

    pub fn check_kind(&self, actual: ElementKind) -> DsmResult<()> {
        if actual != self.element {
            return Err(DsmError::ElementMismatch {
                array: self.id.clone(),
                expected: self.element,
                actual,
            });
        }
        Ok(())
    }

    pub fn check_page(&self, page: PageId) -> DsmResult<()> {
        if page >= self.num_pages {
            return Err(DsmError::Protocol(format!(
                "page {} outside array {} of {} pages",
                page, self.id, self.num_pages
            )));
        }
        Ok(())
    }

    pub fn owner(&self, page: PageId) -> Option<NodeId> {
        self.owners.read().get(&page).cloned()
    }

    /// Records an ownership entry learned from the home node.
    pub fn set_owner(&self, page: PageId, node: NodeId) {
        self.owners.write().insert(page, node);
    }

    /// Assigns `node` as owner if the page has none and remembers `lease` as
    /// the claim. Returns the owner of record.
    pub fn claim_owner(&self, page: PageId, node: &NodeId, lease: &LeaseId) -> NodeId {
        let mut owners = self.owners.write();
        owners
            .entry(page)
            .or_insert_with(|| {
                self.claims.lock().insert(page, lease.clone());
                node.clone()
            })
            .clone()
    }

    /// Reverts the page to unowned if `lease` is what claimed it. Returns the
    /// node that lost the page.
    pub fn withdraw_claim(&self, page: PageId, lease: &LeaseId) -> Option<NodeId> {
        let mut owners = self.owners.write();
        let mut claims = self.claims.lock();
        if claims.get(&page) != Some(lease) {
            return None;
        }
        claims.remove(&page);
        owners.remove(&page)
    }

    /// Drops every ownership entry pointing at `node` and returns the affected pages.
    pub fn forget_owner(&self, node: &NodeId) -> Vec<PageId> {
        let mut owners = self.owners.write();
        let pages: Vec<PageId> = owners
            .iter()
            .filter(|(_, owner)| *owner == node)
            .map(|(page, _)| *page)
            .collect();
        let mut claims = self.claims.lock();
        for page in &pages {
            owners.remove(page);
            claims.remove(page);
        }
        pages
    }

    pub fn version(&self) -> Version {
        self.version.load(Ordering::SeqCst)
    }

    /// Adopts a version reported by the home node. Never moves backwards.
    pub fn set_version(&self, version: Version) {
        self.version.fetch_max(version, Ordering::SeqCst);
    }

    pub fn bump_version(&self) -> Version {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    pub fn set_phase(&self, phase: SyncPhase) {
        *self.phase.lock() = phase;
    }

    /// A write after a completed Sync opens the next phase.
    pub fn resume(&self) {
        let mut phase = self.phase.lock();
        if *phase == SyncPhase::Synced {
            *phase = SyncPhase::Active;
        }
    }

    pub fn touch(&self, page: PageId) {
        self.touched.lock().insert(page);
    }

    pub fn touched_pages(&self) -> Vec<PageId> {
        let mut pages: Vec<PageId> = self.touched.lock().iter().copied().collect();
        pages.sort_unstable();
        pages
    }

    /// Clears the given pages only; pages touched after the snapshot stay pending.
    pub fn clear_touched(&self, pages: &[PageId]) {
        let mut touched = self.touched.lock();
        for page in pages {
            touched.remove(page);
        }
    }
}
