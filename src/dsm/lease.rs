//! Lease Manager
//!
//! Grants, validates, revokes and expires read/write leases keyed by
//! (array, page). The conflict rules are the whole coherence contract:
//!
//! - a Write lease excludes every other lease on the page;
//! - Read leases coexist with each other;
//! - a Read request from a node already reading the page refreshes its lease.
//!
//! Expired leases are void immediately and purged lazily (on acquire and
//! validate) as well as by the periodic sweep started with `spawn_cleanup`.
//!
//! Remote requesters choose the lease id themselves, so an acquisition they
//! abandon can be withdrawn even if the grant never reached them. A withdrawal
//! that overtakes its acquisition leaves a tombstone for one TTL; the late
//! acquisition is then refused.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::{DsmError, DsmResult};
use super::types::{ArrayId, Lease, LeaseId, LeaseType, PageId, PageKey, Version, now_ms};
use crate::membership::types::NodeId;

#[derive(Default)]
struct LeaseTable {
    by_page: HashMap<PageKey, Vec<Lease>>,
    by_id: HashMap<LeaseId, PageKey>,
    /// Withdrawn ids not granted yet, with the time the tombstone lapses.
    withdrawn: HashMap<LeaseId, u64>,
}

impl LeaseTable {
    fn remove_where<F>(&mut self, key: &PageKey, mut predicate: F) -> Vec<Lease>
    where
        F: FnMut(&Lease) -> bool,
    {
        let Some(leases) = self.by_page.get_mut(key) else {
            return Vec::new();
        };

        let (removed, kept): (Vec<Lease>, Vec<Lease>) =
            leases.drain(..).partition(|lease| predicate(lease));
        *leases = kept;
        if leases.is_empty() {
            self.by_page.remove(key);
        }
        for lease in &removed {
            self.by_id.remove(&lease.id);
        }
        removed
    }

    fn insert(&mut self, lease: Lease) {
        self.by_id.insert(lease.id.clone(), lease.key());
        self.by_page.entry(lease.key()).or_default().push(lease);
    }
}

pub struct LeaseManager {
    ttl_ms: u64,
    table: RwLock<LeaseTable>,
}

impl LeaseManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as u64,
            table: RwLock::new(LeaseTable::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Grants a lease or fails with `Conflict` naming the incompatible holder.
    pub fn acquire_lease(
        &self,
        array: &ArrayId,
        page: PageId,
        lease_type: LeaseType,
        owner: &NodeId,
        version: Version,
    ) -> DsmResult<Lease> {
        self.acquire_lease_with_id(LeaseId::new(), array, page, lease_type, owner, version)
    }

    /// Like `acquire_lease`, under an id picked by the requester. An id that
    /// was already withdrawn is refused with `Cancelled`; a refreshed read
    /// lease keeps its original id.
    pub fn acquire_lease_with_id(
        &self,
        id: LeaseId,
        array: &ArrayId,
        page: PageId,
        lease_type: LeaseType,
        owner: &NodeId,
        version: Version,
    ) -> DsmResult<Lease> {
        let key = PageKey::new(array.clone(), page);
        let now = now_ms();
        let mut table = self.table.write();

        if table.withdrawn.remove(&id).is_some() {
            tracing::debug!(lease = %id, page = %key, "Refused lease withdrawn by its requester");
            return Err(DsmError::Cancelled);
        }
        if table.by_id.contains_key(&id) {
            return Err(DsmError::Protocol(format!("lease id {} already in use", id)));
        }

        table.remove_where(&key, |lease| lease.is_expired_at(now));

        if let Some(existing) = table.by_page.get_mut(&key) {
            if let Some(writer) = existing.iter().find(|l| l.lease_type == LeaseType::Write) {
                return Err(DsmError::Conflict {
                    array: array.clone(),
                    page,
                    held: LeaseType::Write,
                    holder: writer.owner.clone(),
                });
            }

            match lease_type {
                LeaseType::Write => {
                    if let Some(reader) = existing.first() {
                        return Err(DsmError::Conflict {
                            array: array.clone(),
                            page,
                            held: LeaseType::Read,
                            holder: reader.owner.clone(),
                        });
                    }
                }
                LeaseType::Read => {
                    if let Some(lease) = existing.iter_mut().find(|l| &l.owner == owner) {
                        lease.expires_at = now + self.ttl_ms;
                        lease.version = version;
                        tracing::trace!(lease = %lease.id, page = %key, "Refreshed read lease");
                        return Ok(lease.clone());
                    }
                }
            }
        }

        let lease = Lease {
            id,
            array: array.clone(),
            page,
            lease_type,
            owner: owner.clone(),
            expires_at: now + self.ttl_ms,
            version,
        };
        table.insert(lease.clone());

        tracing::debug!(
            lease = %lease.id,
            page = %key,
            "Granted {} lease to {}",
            lease_type,
            owner
        );
        Ok(lease)
    }

    pub fn release_lease(&self, id: &LeaseId) -> DsmResult<Lease> {
        let mut table = self.table.write();
        let Some(key) = table.by_id.get(id).cloned() else {
            return Err(DsmError::LeaseNotFound(id.clone()));
        };

        let mut removed = table.remove_where(&key, |lease| &lease.id == id);
        match removed.pop() {
            Some(lease) => {
                tracing::debug!(lease = %id, page = %key, "Released {} lease", lease.lease_type);
                Ok(lease)
            }
            None => Err(DsmError::LeaseNotFound(id.clone())),
        }
    }

    /// Removes a lease its requester gave up on. If the id is unknown, the
    /// acquisition may still be in flight, so a tombstone refuses it later.
    pub fn withdraw_lease(&self, id: &LeaseId) -> Option<Lease> {
        let mut table = self.table.write();
        if let Some(key) = table.by_id.get(id).cloned() {
            let withdrawn = table.remove_where(&key, |lease| &lease.id == id).pop();
            tracing::debug!(lease = %id, page = %key, "Withdrew abandoned lease");
            return withdrawn;
        }
        table.withdrawn.insert(id.clone(), now_ms() + self.ttl_ms);
        None
    }

    /// Returns the lease if it is still live. An expired lease is purged and reported as `Expired`.
    pub fn validate_lease(&self, id: &LeaseId) -> DsmResult<Lease> {
        let now = now_ms();
        {
            let table = self.table.read();
            let lease = table
                .by_id
                .get(id)
                .and_then(|key| table.by_page.get(key))
                .and_then(|leases| leases.iter().find(|l| &l.id == id));

            match lease {
                None => return Err(DsmError::LeaseNotFound(id.clone())),
                Some(lease) if !lease.is_expired_at(now) => return Ok(lease.clone()),
                Some(_) => {}
            }
        }

        let mut table = self.table.write();
        let key = table.by_id.get(id).cloned();
        let expired = key
            .map(|key| table.remove_where(&key, |l| &l.id == id && l.is_expired_at(now)))
            .unwrap_or_default();

        match expired.into_iter().next() {
            Some(lease) => Err(DsmError::Expired {
                lease: lease.id,
                array: lease.array,
                page: lease.page,
            }),
            // Refreshed or released between the two lock scopes
            None => table
                .by_id
                .get(id)
                .and_then(|key| table.by_page.get(key))
                .and_then(|leases| leases.iter().find(|l| &l.id == id))
                .cloned()
                .ok_or_else(|| DsmError::LeaseNotFound(id.clone())),
        }
    }

    pub fn has_write_lease(&self, array: &ArrayId, page: PageId) -> bool {
        let key = PageKey::new(array.clone(), page);
        let now = now_ms();
        self.table
            .read()
            .by_page
            .get(&key)
            .map(|leases| {
                leases
                    .iter()
                    .any(|l| l.lease_type == LeaseType::Write && !l.is_expired_at(now))
            })
            .unwrap_or(false)
    }

    /// Live leases on a page.
    pub fn leases_for(&self, array: &ArrayId, page: PageId) -> Vec<Lease> {
        let key = PageKey::new(array.clone(), page);
        let now = now_ms();
        self.table
            .read()
            .by_page
            .get(&key)
            .map(|leases| {
                leases
                    .iter()
                    .filter(|l| !l.is_expired_at(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Clears every lease on the page. Idempotent.
    pub fn revoke_lease(&self, array: &ArrayId, page: PageId) -> Vec<Lease> {
        let key = PageKey::new(array.clone(), page);
        let revoked = self.table.write().remove_where(&key, |_| true);
        if !revoked.is_empty() {
            tracing::debug!(page = %key, "Revoked {} lease(s)", revoked.len());
        }
        revoked
    }

    /// Clears every lease held by `owner`, across all pages.
    pub fn revoke_leases_held_by(&self, owner: &NodeId) -> Vec<Lease> {
        let mut table = self.table.write();
        let keys: Vec<PageKey> = table
            .by_page
            .iter()
            .filter(|(_, leases)| leases.iter().any(|l| &l.owner == owner))
            .map(|(key, _)| key.clone())
            .collect();

        let mut revoked = Vec::new();
        for key in keys {
            revoked.extend(table.remove_where(&key, |l| &l.owner == owner));
        }
        revoked
    }

    /// Clears every lease on every page of an array.
    pub fn revoke_array(&self, array: &ArrayId) -> usize {
        let mut table = self.table.write();
        let keys: Vec<PageKey> = table
            .by_page
            .keys()
            .filter(|key| &key.array == array)
            .cloned()
            .collect();

        keys.iter()
            .map(|key| table.remove_where(key, |_| true).len())
            .sum()
    }

    /// Purges every lease past its expiry. Returns how many were removed.
    pub fn cleanup_expired_leases(&self) -> usize {
        let now = now_ms();
        let mut table = self.table.write();
        let keys: Vec<PageKey> = table
            .by_page
            .iter()
            .filter(|(_, leases)| leases.iter().any(|l| l.is_expired_at(now)))
            .map(|(key, _)| key.clone())
            .collect();

        let removed: usize = keys
            .iter()
            .map(|key| table.remove_where(key, |l| l.is_expired_at(now)).len())
            .sum();
        table.withdrawn.retain(|_, lapses_at| *lapses_at >= now);

        if removed > 0 {
            tracing::debug!("Lease sweep removed {} expired lease(s)", removed);
        }
        removed
    }

    /// Number of leases in the table, expired or not.
    pub fn lease_count(&self) -> usize {
        self.table.read().by_id.len()
    }

    /// Runs `cleanup_expired_leases` every `interval` until `cancel` fires.
    pub fn spawn_cleanup(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.cleanup_expired_leases();
                    }
                }
            }
            tracing::debug!("Lease sweep stopped");
        })
    }
}
