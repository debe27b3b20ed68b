//! Sync Barrier
//!
//! The only deterministic visibility boundary between phases of a parallel
//! computation. A Sync on an array walks it through
//! `Active -> Flushing -> Invalidating -> Synced`:
//!
//! 1. **Flush**: each buffered page is re-validated against its Write lease at
//!    the home node and pushed to its owner of record.
//! 2. **Revoke**: every lease this node holds on the array is released.
//! 3. **Invalidate**: pages touched since the last Sync are dropped from the
//!    local cache and from every peer's cache.
//! 4. **Bump**: the array version is advanced at the home node.
//!
//! Any failure returns the array to `Active` and keeps the touched set, so
//! the caller can reissue the Sync.

use tokio_util::sync::CancellationToken;

use super::array::{Array, SyncPhase};
use super::error::{DsmError, DsmResult};
use super::manager::{MemoryManager, tolerate_missing};
use super::protocol::{DsmRequest, DsmResponse, unexpected};
use super::types::{ArrayId, Lease, LeaseId, LeaseType, PageId, PageKey, Version};
use crate::membership::types::NodeId;

impl MemoryManager {
    /// Runs the barrier for one array. Concurrent Syncs of the same array on
    /// this node run one after another.
    pub async fn sync(&self, id: &ArrayId, cancel: &CancellationToken) -> DsmResult<Version> {
        let array = self.get_array(id)?;
        let _serial = tokio::select! {
            _ = cancel.cancelled() => return Err(DsmError::Cancelled),
            guard = array.sync_lock.lock() => guard,
        };

        let result = self.run_sync(&array, cancel).await;
        match &result {
            Ok(version) => {
                array.set_phase(SyncPhase::Synced);
                tracing::info!(array = %id, version, "Sync complete");
            }
            Err(e) => {
                array.set_phase(SyncPhase::Active);
                tracing::warn!(array = %id, "Sync failed: {}", e);
            }
        }
        result
    }

    async fn run_sync(&self, array: &Array, cancel: &CancellationToken) -> DsmResult<Version> {
        let touched = array.touched_pages();

        array.set_phase(SyncPhase::Flushing);
        let flushed = self.flush(array, cancel).await?;
        let released = self.release_leases(array, cancel).await?;

        array.set_phase(SyncPhase::Invalidating);
        self.invalidate(array, &touched, cancel).await?;

        let version = self.bump(array, cancel).await?;
        array.clear_touched(&touched);

        // Writes that raced with the flush stay buffered for the next Sync
        for entry in self.dirty.iter().filter(|e| e.key().array == array.id) {
            array.touch(entry.key().page);
        }

        tracing::debug!(
            array = %array.id,
            flushed,
            released,
            invalidated = touched.len(),
            "Sync phases finished"
        );
        Ok(version)
    }

    async fn flush(&self, array: &Array, cancel: &CancellationToken) -> DsmResult<usize> {
        let keys: Vec<PageKey> = self
            .dirty
            .iter()
            .filter(|e| e.key().array == array.id)
            .map(|e| e.key().clone())
            .collect();

        let mut flushed = 0;
        for key in keys {
            let lease = self
                .held
                .get(&key)
                .map(|e| e.value().clone())
                .filter(|lease| lease.lease_type == LeaseType::Write);
            let Some(lease) = lease else {
                self.dirty.remove(&key);
                return Err(DsmError::Protocol(format!(
                    "buffered page {} has no write lease",
                    key
                )));
            };

            self.check_write_lease(array, &key, &lease, cancel).await?;

            let Some(buffered) = self.dirty.get(&key).map(|e| e.value().clone()) else {
                continue;
            };
            let data = {
                let mut page = buffered.write();
                page.mark_clean();
                page.to_bytes()
            };

            let owner = array.owner(key.page).ok_or_else(|| DsmError::NoOwner {
                array: array.id.clone(),
                page: key.page,
            })?;
            let pushed = self
                .push_page(array, key.page, &owner, &lease.id, data, cancel)
                .await;
            if let Err(e) = pushed {
                return Err(self.discard_if_expired(array, &key, &lease, e));
            }

            // Keep the copy if a concurrent write dirtied it again
            self.dirty.remove_if(&key, |_, page| !page.read().is_dirty());
            self.cache.remove(&key);
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Confirms with the home that the Write lease is still live. An expired
    /// lease discards the buffered page: committing it would break SWMR.
    async fn check_write_lease(
        &self,
        array: &Array,
        key: &PageKey,
        lease: &Lease,
        cancel: &CancellationToken,
    ) -> DsmResult<()> {
        match self.validate_at_home(array, &lease.id, cancel).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.discard_if_expired(array, key, lease, e)),
        }
    }

    /// A lease the home no longer knows voids the buffered page. Other
    /// failures leave it for a retried Sync.
    fn discard_if_expired(
        &self,
        array: &Array,
        key: &PageKey,
        lease: &Lease,
        err: DsmError,
    ) -> DsmError {
        match err {
            DsmError::Expired { .. } | DsmError::LeaseNotFound(_) => {
                self.dirty.remove(key);
                self.held.remove(key);
                tracing::warn!(page = %key, "Write lease {} expired before flush; buffered page discarded", lease.id);
                DsmError::Expired {
                    lease: lease.id.clone(),
                    array: array.id.clone(),
                    page: key.page,
                }
            }
            other => other,
        }
    }

    async fn push_page(
        &self,
        array: &Array,
        page: PageId,
        owner: &NodeId,
        lease: &LeaseId,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> DsmResult<Version> {
        if owner == &self.local {
            return self.commit_local(array, page, data);
        }

        let request = DsmRequest::PushPage {
            array: array.id.clone(),
            page,
            version: array.version(),
            lease: lease.clone(),
            data,
        };
        match self.call(owner, request, cancel).await? {
            DsmResponse::Version(version) => Ok(version),
            other => Err(unexpected("Version", &other)),
        }
    }

    /// Releases every lease this node holds on the array, except on pages
    /// that still carry unflushed writes.
    async fn release_leases(&self, array: &Array, cancel: &CancellationToken) -> DsmResult<usize> {
        let held: Vec<Lease> = self
            .held
            .iter()
            .filter(|e| e.key().array == array.id && !self.dirty.contains_key(e.key()))
            .map(|e| e.value().clone())
            .collect();

        let mut released = 0;
        for lease in held {
            tolerate_missing(self.release_at_home(array, &lease, cancel).await)?;
            self.held.remove(&lease.key());
            released += 1;
        }
        Ok(released)
    }

    async fn invalidate(
        &self,
        array: &Array,
        pages: &[PageId],
        cancel: &CancellationToken,
    ) -> DsmResult<()> {
        if pages.is_empty() {
            return Ok(());
        }
        self.invalidate_local(&array.id, pages);

        for peer in self.peers() {
            let request = DsmRequest::Invalidate {
                array: array.id.clone(),
                pages: pages.to_vec(),
            };
            match self.call(&peer, request, cancel).await {
                Ok(DsmResponse::Ack) => {}
                Ok(other) => return Err(unexpected("Ack", &other)),
                Err(e) => {
                    tracing::warn!(array = %array.id, "Invalidation at {} failed: {}", peer, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn bump(&self, array: &Array, cancel: &CancellationToken) -> DsmResult<Version> {
        if array.home == self.local {
            return Ok(array.bump_version());
        }

        let request = DsmRequest::BumpVersion {
            array: array.id.clone(),
        };
        match self.call(&array.home, request, cancel).await? {
            DsmResponse::Version(version) => {
                array.set_version(version);
                Ok(version)
            }
            other => Err(unexpected("Version", &other)),
        }
    }
}
