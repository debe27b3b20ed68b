//! Memory Manager
//!
//! Top-level facade of the coherence engine. One instance per node owns the
//! lease table, the page cache, the array registry and the node's local page
//! storage. All state is constructed here and injected, so several engines
//! can run side by side in one process.
//!
//! ## Responsibilities
//! - **Array lifecycle**: create, announce, register, look up and delete arrays.
//! - **Ownership resolution**: find the owner of a page and serve it locally or fetch it remotely.
//! - **Element access**: lease-checked typed reads, buffered typed writes.
//! - **Home routing**: lease and version requests go to the array's home node.
//!
//! Every remote exchange runs under the caller's cancellation token and the
//! configured request timeout.

use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::array::{Array, ArrayDescriptor};
use super::cache::{CacheStats, PageCache};
use super::error::{DsmError, DsmResult};
use super::lease::LeaseManager;
use super::page::{Page, PageRef};
use super::protocol::{self, DsmRequest, DsmResponse, unexpected};
use super::storage::Element;
use super::types::{ArrayId, ElementKind, Lease, LeaseId, LeaseType, PageId, PageKey, Version};
use crate::config::DsmConfig;
use crate::membership::types::NodeId;
use crate::transport::{Transport, TransportError};

/// Treats a lease that is already gone as released.
pub(crate) fn tolerate_missing(result: DsmResult<()>) -> DsmResult<()> {
    match result {
        Err(DsmError::LeaseNotFound(_)) => Ok(()),
        other => other,
    }
}

pub struct MemoryManager {
    pub(crate) local: NodeId,
    transport: Arc<dyn Transport>,
    config: DsmConfig,
    pub(crate) leases: Arc<LeaseManager>,
    pub(crate) cache: PageCache,
    arrays: DashMap<ArrayId, Arc<Array>>,
    /// Pages this node owns, materialized on first access.
    pages: DashMap<PageKey, PageRef>,
    /// Leases this node currently holds, at most one per page.
    pub(crate) held: DashMap<PageKey, Lease>,
    /// Private copies carrying writes not yet flushed by a Sync.
    pub(crate) dirty: DashMap<PageKey, PageRef>,
    /// Single-flight gates for lease acquisition per page.
    acquiring: DashMap<PageKey, Arc<tokio::sync::Mutex<()>>>,
    shutdown: CancellationToken,
}

impl MemoryManager {
    pub fn new(transport: Arc<dyn Transport>, config: DsmConfig) -> Arc<Self> {
        Arc::new(Self {
            local: transport.local_node().clone(),
            leases: Arc::new(LeaseManager::new(config.lease_ttl())),
            cache: PageCache::new(config.cache_capacity),
            transport,
            config,
            arrays: DashMap::new(),
            pages: DashMap::new(),
            held: DashMap::new(),
            dirty: DashMap::new(),
            acquiring: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Starts the periodic expired-lease sweep.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        tracing::info!(
            "DSM engine {} started (page size {}, cache {} pages, lease ttl {:?})",
            self.local,
            self.config.page_size,
            self.cache.capacity(),
            self.config.lease_ttl()
        );
        self.leases
            .clone()
            .spawn_cleanup(self.config.cleanup_interval(), self.shutdown.clone())
    }

    /// Cancels background tasks and every in-flight remote call.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// A token cancelled together with the engine.
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    pub fn config(&self) -> &DsmConfig {
        &self.config
    }

    pub fn lease_manager(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // --- Array lifecycle ---

    /// Allocates a new array homed on this node. No pages are materialized.
    pub async fn create_array(&self, length: u64, element: ElementKind) -> DsmResult<Arc<Array>> {
        let array = Arc::new(Array::new(
            length,
            element,
            self.config.page_size,
            self.local.clone(),
        )?);
        self.arrays.insert(array.id.clone(), array.clone());

        tracing::info!(
            array = %array.id,
            "Created array of {} {} elements across {} pages",
            length,
            element,
            array.num_pages
        );

        let announce = DsmRequest::AnnounceArray {
            descriptor: array.descriptor(),
        };
        for (node, err) in self.broadcast(announce, &self.shutdown).await {
            tracing::warn!(array = %array.id, "Failed to announce array to {}: {}", node, err);
        }

        Ok(array)
    }

    /// Installs a descriptor received from another node. Idempotent.
    pub fn register_array(&self, descriptor: ArrayDescriptor) -> DsmResult<Arc<Array>> {
        if descriptor.page_size != self.config.page_size {
            return Err(DsmError::PageSizeMismatch {
                array: descriptor.id,
                page: 0,
                expected: self.config.page_size,
                actual: descriptor.page_size,
            });
        }

        let known = self.arrays.get(&descriptor.id).map(|e| e.value().clone());
        let array = match known {
            Some(array) => array,
            None => {
                let array = Arc::new(Array::from_descriptor(descriptor.clone())?);
                let installed = self
                    .arrays
                    .entry(descriptor.id.clone())
                    .or_insert(array)
                    .value()
                    .clone();
                tracing::info!(array = %descriptor.id, "Registered array homed on {}", descriptor.home);
                installed
            }
        };

        array.set_version(descriptor.version);
        for (page, owner) in descriptor.owners {
            array.set_owner(page, owner);
        }
        Ok(array)
    }

    pub fn get_array(&self, id: &ArrayId) -> DsmResult<Arc<Array>> {
        self.arrays
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DsmError::ArrayNotFound(id.clone()))
    }

    /// Removes the array everywhere. Buffered writes of the array are discarded.
    pub async fn delete_array(&self, id: &ArrayId) -> DsmResult<()> {
        if self.drop_local(id).is_none() {
            return Err(DsmError::ArrayNotFound(id.clone()));
        }
        tracing::info!(array = %id, "Deleted array");

        let drop = DsmRequest::DropArray { array: id.clone() };
        for (node, err) in self.broadcast(drop, &self.shutdown).await {
            tracing::warn!(array = %id, "Failed to notify {} of deletion: {}", node, err);
        }
        Ok(())
    }

    /// Forgets every local trace of an array.
    pub(crate) fn drop_local(&self, id: &ArrayId) -> Option<Arc<Array>> {
        let (_, array) = self.arrays.remove(id)?;

        let discarded = self.dirty.iter().filter(|e| &e.key().array == id).count();
        if discarded > 0 {
            tracing::warn!(array = %id, "Discarding {} buffered page(s)", discarded);
        }

        self.pages.retain(|key, _| &key.array != id);
        self.dirty.retain(|key, _| &key.array != id);
        self.held.retain(|key, _| &key.array != id);
        self.acquiring.retain(|key, _| &key.array != id);
        self.cache.remove_array(id);
        if array.home == self.local {
            self.leases.revoke_array(id);
        }
        Some(array)
    }

    /// Releases every lease this node holds on the array and drops its cached
    /// pages. Unflushed writes are discarded.
    pub async fn close_array(&self, id: &ArrayId) -> DsmResult<()> {
        let array = self.get_array(id)?;

        let buffered: Vec<PageKey> = self
            .dirty
            .iter()
            .filter(|e| &e.key().array == id)
            .map(|e| e.key().clone())
            .collect();
        for key in &buffered {
            self.dirty.remove(key);
        }
        if !buffered.is_empty() {
            tracing::warn!(array = %id, "Closed with {} unsynced page(s)", buffered.len());
        }

        let held: Vec<Lease> = self
            .held
            .iter()
            .filter(|e| &e.key().array == id)
            .map(|e| e.value().clone())
            .collect();
        for lease in held {
            self.held.remove(&lease.key());
            let released = self.release_at_home(&array, &lease, &self.shutdown).await;
            if let Err(e) = tolerate_missing(released) {
                tracing::warn!(array = %id, "Lease {} left to expire: {}", lease.id, e);
            }
        }

        let dropped = self.cache.remove_array(id);
        tracing::debug!(array = %id, "Closed array, dropped {} cached page(s)", dropped);
        Ok(())
    }

    // --- Pages ---

    /// The locally stored page, created zero-filled on first access.
    pub fn local_page(&self, array: &Array, page: PageId) -> PageRef {
        self.pages
            .entry(PageKey::new(array.id.clone(), page))
            .or_insert_with(|| Page::new(page, array.page_size).into_ref())
            .value()
            .clone()
    }

    /// Resolves the page's owner and serves it from local storage, the cache or the owner.
    pub async fn request_page(
        &self,
        id: &ArrayId,
        page: PageId,
        version: Version,
        cancel: &CancellationToken,
    ) -> DsmResult<PageRef> {
        let array = self.get_array(id)?;
        array.check_page(page)?;
        let owner = array.owner(page).ok_or_else(|| DsmError::NoOwner {
            array: id.clone(),
            page,
        })?;
        self.page_from(&array, page, &owner, version, cancel).await
    }

    async fn page_from(
        &self,
        array: &Array,
        page: PageId,
        owner: &NodeId,
        version: Version,
        cancel: &CancellationToken,
    ) -> DsmResult<PageRef> {
        if owner == &self.local {
            return Ok(self.local_page(array, page));
        }

        let key = PageKey::new(array.id.clone(), page);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let request = DsmRequest::FetchPage {
            array: array.id.clone(),
            page,
            version,
        };
        let (page_version, data) = match self.call(owner, request, cancel).await? {
            DsmResponse::Page { version, data } => (version, data),
            other => return Err(unexpected("Page", &other)),
        };

        if data.len() != array.page_size {
            return Err(DsmError::PageSizeMismatch {
                array: array.id.clone(),
                page,
                expected: array.page_size,
                actual: data.len(),
            });
        }

        let fetched = Page::from_bytes(page, page_version, data).into_ref();
        self.cache.put(key.clone(), fetched.clone());
        tracing::debug!(page = %key, version = page_version, "Fetched page from {}", owner);
        Ok(fetched)
    }

    /// Installs flushed bytes into a locally owned page.
    pub(crate) fn commit_local(&self, array: &Array, page: PageId, data: Vec<u8>) -> DsmResult<Version> {
        if data.len() != array.page_size {
            return Err(DsmError::PageSizeMismatch {
                array: array.id.clone(),
                page,
                expected: array.page_size,
                actual: data.len(),
            });
        }
        let version = self.local_page(array, page).write().commit(data);
        tracing::debug!(array = %array.id, page, version, "Committed page");
        Ok(version)
    }

    // --- Elements ---

    /// Reads one element. Writes buffered on this node are visible to it;
    /// another node's writes are guaranteed visible only after its Sync.
    pub async fn get_element<T: Element>(
        &self,
        id: &ArrayId,
        index: u64,
        cancel: &CancellationToken,
    ) -> DsmResult<T> {
        if cancel.is_cancelled() {
            return Err(DsmError::Cancelled);
        }
        let array = self.get_array(id)?;
        array.check_kind(T::KIND)?;
        let (page, slot) = array.locate(index)?;
        let key = PageKey::new(array.id.clone(), page);

        let buffered = self.dirty.get(&key).map(|e| e.value().clone());
        if let Some(buffered) = buffered {
            return buffered.read().read::<T>(slot);
        }

        let Some(owner) = self.ensure_lease(&array, page, LeaseType::Read, cancel).await? else {
            // Nobody has written the page yet
            return Ok(T::default());
        };

        self.page_from(&array, page, &owner, array.version(), cancel)
            .await?
            .read()
            .read::<T>(slot)
    }

    /// Writes one element into this node's private copy of the page under a Write lease.
    pub async fn set_element<T: Element>(
        &self,
        id: &ArrayId,
        index: u64,
        value: T,
        cancel: &CancellationToken,
    ) -> DsmResult<()> {
        if cancel.is_cancelled() {
            return Err(DsmError::Cancelled);
        }
        let array = self.get_array(id)?;
        array.check_kind(T::KIND)?;
        let (page, slot) = array.locate(index)?;
        let key = PageKey::new(array.id.clone(), page);

        let owner = self
            .ensure_lease(&array, page, LeaseType::Write, cancel)
            .await?
            .ok_or_else(|| DsmError::NoOwner {
                array: array.id.clone(),
                page,
            })?;

        let existing = self.dirty.get(&key).map(|e| e.value().clone());
        let buffered = match existing {
            Some(buffered) => buffered,
            None => {
                let base = self
                    .page_from(&array, page, &owner, array.version(), cancel)
                    .await?;
                let copy = base.read().clone().into_ref();
                self.dirty.entry(key).or_insert(copy).value().clone()
            }
        };

        buffered.write().write::<T>(slot, value)?;
        array.touch(page);
        array.resume();
        Ok(())
    }

    // --- Leases ---

    /// Grants a lease from this node's authoritative table under the
    /// requester's id. A Write grant on an unowned page makes the grantee its
    /// owner.
    pub(crate) fn grant_lease(
        &self,
        array: &Array,
        page: PageId,
        lease_type: LeaseType,
        owner: &NodeId,
        version: Version,
        id: LeaseId,
    ) -> DsmResult<(Lease, Option<NodeId>)> {
        array.check_page(page)?;
        let lease = self
            .leases
            .acquire_lease_with_id(id, &array.id, page, lease_type, owner, version)?;
        let owner_of_record = match lease_type {
            LeaseType::Write => Some(array.claim_owner(page, owner, &lease.id)),
            LeaseType::Read => array.owner(page),
        };
        Ok((lease, owner_of_record))
    }

    /// Undoes a grant whose requester gave up: drops the lease and the
    /// ownership it claimed. Safe to call before the grant happens.
    pub(crate) fn withdraw_grant(&self, array: &Array, page: PageId, id: &LeaseId) {
        let lease = self.leases.withdraw_lease(id);
        let unowned = array.withdraw_claim(page, id);
        tracing::info!(
            array = %array.id,
            page,
            lease = %id,
            "Withdrew abandoned acquisition (lease granted: {}, ownership reverted: {})",
            lease.is_some(),
            unowned.is_some()
        );
    }

    /// Makes sure this node holds a lease covering `want` and returns the page owner.
    async fn ensure_lease(
        &self,
        array: &Array,
        page: PageId,
        want: LeaseType,
        cancel: &CancellationToken,
    ) -> DsmResult<Option<NodeId>> {
        let key = PageKey::new(array.id.clone(), page);
        let gate = self.acquiring.entry(key.clone()).or_default().value().clone();
        let result = self.ensure_lease_gated(array, page, want, &gate, cancel).await;

        // Nobody else waits on the gate: only the map and this call hold it
        self.acquiring
            .remove_if(&key, |_, g| Arc::ptr_eq(g, &gate) && Arc::strong_count(g) <= 2);
        result
    }

    async fn ensure_lease_gated(
        &self,
        array: &Array,
        page: PageId,
        want: LeaseType,
        gate: &tokio::sync::Mutex<()>,
        cancel: &CancellationToken,
    ) -> DsmResult<Option<NodeId>> {
        let key = PageKey::new(array.id.clone(), page);
        let _gate = tokio::select! {
            _ = cancel.cancelled() => return Err(DsmError::Cancelled),
            guard = gate.lock() => guard,
        };

        let held = self.held.get(&key).map(|e| e.value().clone());
        if let Some(held) = held {
            let covers = held.lease_type == LeaseType::Write || want == LeaseType::Read;
            if covers && !held.is_expired() {
                return Ok(array.owner(page));
            }

            self.held.remove(&key);
            if held.is_expired() {
                if self.dirty.remove(&key).is_some() {
                    tracing::warn!(page = %key, "Write lease {} expired; buffered page discarded", held.id);
                    return Err(DsmError::Expired {
                        lease: held.id,
                        array: array.id.clone(),
                        page,
                    });
                }
            } else {
                // Upgrade: give up the read lease before asking for the write lease
                tolerate_missing(self.release_at_home(array, &held, cancel).await)?;
            }
        }

        let version = array.version();
        let id = LeaseId::new();
        let (lease, owner) = if array.home == self.local {
            self.grant_lease(array, page, want, &self.local, version, id)?
        } else {
            let request = DsmRequest::AcquireLease {
                array: array.id.clone(),
                page,
                lease_type: want,
                owner: self.local.clone(),
                version,
                lease: id.clone(),
            };
            match self.call(&array.home, request, cancel).await {
                Ok(DsmResponse::LeaseGranted { lease, owner }) => (lease, owner),
                Ok(other) => return Err(unexpected("LeaseGranted", &other)),
                Err(
                    e @ (DsmError::Cancelled
                    | DsmError::Timeout { .. }
                    | DsmError::Unreachable { .. }),
                ) => {
                    // The home may have granted it without the reply reaching us
                    self.withdraw_at_home(array, page, &id).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(owner) = &owner {
            array.set_owner(page, owner.clone());
        }
        tracing::debug!(page = %key, lease = %lease.id, "Holding {} lease", lease.lease_type);
        self.held.insert(key, lease);
        Ok(owner)
    }

    /// The lease this node holds on a page, if any.
    pub fn held_lease(&self, id: &ArrayId, page: PageId) -> Option<Lease> {
        self.held
            .get(&PageKey::new(id.clone(), page))
            .map(|e| e.value().clone())
    }

    pub(crate) async fn release_at_home(
        &self,
        array: &Array,
        lease: &Lease,
        cancel: &CancellationToken,
    ) -> DsmResult<()> {
        if array.home == self.local {
            return self.leases.release_lease(&lease.id).map(|_| ());
        }
        let request = DsmRequest::ReleaseLease {
            lease: lease.id.clone(),
        };
        match self.call(&array.home, request, cancel).await? {
            DsmResponse::Ack => Ok(()),
            other => Err(unexpected("Ack", &other)),
        }
    }

    /// Best-effort withdrawal of an abandoned acquisition, bounded by the
    /// engine shutdown and the request timeout only.
    async fn withdraw_at_home(&self, array: &Array, page: PageId, id: &LeaseId) {
        let request = DsmRequest::WithdrawLease {
            array: array.id.clone(),
            page,
            lease: id.clone(),
        };
        match self.call(&array.home, request, &self.shutdown).await {
            Ok(DsmResponse::Ack) => {}
            Ok(other) => tracing::warn!(lease = %id, "Withdrawal got {} reply", other.name()),
            Err(e) => tracing::warn!(
                lease = %id,
                "Could not withdraw lease at {}, it expires with its TTL: {}",
                array.home,
                e
            ),
        }
    }

    pub(crate) async fn validate_at_home(
        &self,
        array: &Array,
        lease: &LeaseId,
        cancel: &CancellationToken,
    ) -> DsmResult<Lease> {
        if array.home == self.local {
            return self.leases.validate_lease(lease);
        }
        let request = DsmRequest::ValidateLease {
            lease: lease.clone(),
        };
        match self.call(&array.home, request, cancel).await? {
            DsmResponse::Lease(lease) => Ok(lease),
            other => Err(unexpected("Lease", &other)),
        }
    }

    /// Clears every lease on a page at the array's home. Idempotent.
    pub async fn revoke_page(
        &self,
        id: &ArrayId,
        page: PageId,
        cancel: &CancellationToken,
    ) -> DsmResult<()> {
        let array = self.get_array(id)?;
        self.held.remove(&PageKey::new(id.clone(), page));
        if array.home == self.local {
            self.leases.revoke_lease(id, page);
            return Ok(());
        }
        let request = DsmRequest::RevokeLease {
            array: id.clone(),
            page,
        };
        match self.call(&array.home, request, cancel).await? {
            DsmResponse::Ack => Ok(()),
            other => Err(unexpected("Ack", &other)),
        }
    }

    // --- Failure hooks ---

    /// Drops every ownership entry pointing at `node` along with the cached
    /// copies of those pages. Returns the affected pages.
    pub fn forget_owner(&self, node: &NodeId) -> Vec<PageKey> {
        let mut forgotten = Vec::new();
        for entry in self.arrays.iter() {
            let array = entry.value();
            for page in array.forget_owner(node) {
                let key = PageKey::new(array.id.clone(), page);
                self.cache.remove(&key);
                forgotten.push(key);
            }
        }
        forgotten
    }

    /// Drops cached copies of the listed pages.
    pub fn invalidate_local(&self, id: &ArrayId, pages: &[PageId]) -> usize {
        pages
            .iter()
            .filter(|page| self.cache.remove(&PageKey::new(id.clone(), **page)).is_some())
            .count()
    }

    // --- Remote calls ---

    /// One request/response exchange with `node`, bounded by the request
    /// timeout and abandoned when `cancel` or the engine shutdown fires.
    pub(crate) async fn call(
        &self,
        node: &NodeId,
        request: DsmRequest,
        cancel: &CancellationToken,
    ) -> DsmResult<DsmResponse> {
        let kind = request.stream_kind();
        let payload = protocol::encode_request(&request)?;
        let timeout = self.config.request_timeout();

        let exchange = async {
            let connection = self.transport.connect(node).await?;
            let mut stream = connection.open_stream(kind).await?;
            stream.write_message(&payload).await?;
            let reply = stream.read_message().await?;
            if let Err(e) = stream.close().await {
                tracing::trace!("Closing stream to {} failed: {}", node, e);
            }
            Ok::<Vec<u8>, TransportError>(reply)
        };

        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(DsmError::Cancelled),
            _ = self.shutdown.cancelled() => return Err(DsmError::Cancelled),
            result = tokio::time::timeout(timeout, exchange) => match result {
                Ok(reply) => reply.map_err(|e| DsmError::unreachable(node, e))?,
                Err(_) => {
                    return Err(DsmError::Timeout {
                        node: node.clone(),
                        after_ms: timeout.as_millis() as u64,
                    });
                }
            },
        };

        match protocol::decode_response(&reply)? {
            DsmResponse::Error(err) => Err(err),
            response => Ok(response),
        }
    }

    /// Sends `request` to every peer and collects the failures.
    pub(crate) async fn broadcast(
        &self,
        request: DsmRequest,
        cancel: &CancellationToken,
    ) -> Vec<(NodeId, DsmError)> {
        let mut failures = Vec::new();
        for peer in self.transport.peers() {
            match self.call(&peer, request.clone(), cancel).await {
                Ok(DsmResponse::Ack) => {}
                Ok(other) => failures.push((peer, unexpected("Ack", &other))),
                Err(e) => failures.push((peer, e)),
            }
        }
        failures
    }

    pub(crate) fn peers(&self) -> Vec<NodeId> {
        self.transport.peers()
    }

    #[cfg(test)]
    pub(crate) fn gate_count(&self) -> usize {
        self.acquiring.len()
    }
}
