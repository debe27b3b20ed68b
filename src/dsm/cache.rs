//! Page Cache (2Q)
//!
//! Bounded, node-local cache of pages fetched from remote owners. Entries live
//! on one of two recency lists:
//!
//! - **once**: pages touched a single time, newest at the front;
//! - **frequent**: pages touched again, most recently used at the front.
//!
//! A second touch promotes an entry to the front of `frequent`. Eviction takes
//! the back of `once` and only falls back to the back of `frequent` when
//! `once` is empty, so one-off scans cannot flush the reused working set.
//!
//! The cache knows nothing about leases. A miss only means the page has to be
//! fetched again.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::page::PageRef;
use super::types::{ArrayId, PageKey};

// ═══════════════════════════════════════════════════════════════════════
// Slab-backed recency list
// ═══════════════════════════════════════════════════════════════════════

struct Link<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly-linked list over a slab with index links and a free list.
struct RecencyList<T> {
    slots: Vec<Option<Link<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> RecencyList<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn link_mut(&mut self, idx: usize) -> Option<&mut Link<T>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    #[cfg(test)]
    fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx)?.as_ref().map(|link| &link.value)
    }

    fn push_front(&mut self, value: T) -> usize {
        let link = Link {
            value,
            prev: None,
            next: self.head,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(link);
                idx
            }
            None => {
                self.slots.push(Some(link));
                self.slots.len() - 1
            }
        };

        match self.head {
            Some(old_head) => {
                if let Some(head) = self.link_mut(old_head) {
                    head.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
        idx
    }

    fn remove(&mut self, idx: usize) -> Option<T> {
        let link = self.slots.get_mut(idx)?.take()?;

        match link.prev {
            Some(prev) => {
                if let Some(p) = self.link_mut(prev) {
                    p.next = link.next;
                }
            }
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(n) = self.link_mut(next) {
                    n.prev = link.prev;
                }
            }
            None => self.tail = link.prev,
        }

        self.free.push(idx);
        self.len -= 1;
        Some(link.value)
    }

    fn pop_back(&mut self) -> Option<T> {
        let tail = self.tail?;
        self.remove(tail)
    }

    /// Values from front (newest) to back (oldest).
    fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let link = self.slots.get(cursor?)?.as_ref()?;
            cursor = link.next;
            Some(&link.value)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 2Q cache
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Once,
    Frequent,
}

#[derive(Debug, Clone, Copy)]
struct Location {
    queue: Queue,
    idx: usize,
}

struct CacheEntry {
    key: PageKey,
    page: PageRef,
}

struct CacheState {
    index: HashMap<PageKey, Location>,
    once: RecencyList<CacheEntry>,
    frequent: RecencyList<CacheEntry>,
}

impl CacheState {
    fn list_mut(&mut self, queue: Queue) -> &mut RecencyList<CacheEntry> {
        match queue {
            Queue::Once => &mut self.once,
            Queue::Frequent => &mut self.frequent,
        }
    }

    fn detach(&mut self, key: &PageKey) -> Option<CacheEntry> {
        let location = self.index.remove(key)?;
        self.list_mut(location.queue).remove(location.idx)
    }

    /// Moves an entry to the front of `frequent`, optionally swapping its page.
    fn promote(&mut self, key: &PageKey, replacement: Option<PageRef>) -> Option<PageRef> {
        let mut entry = self.detach(key)?;
        if let Some(page) = replacement {
            entry.page = page;
        }
        let page = entry.page.clone();
        let idx = self.frequent.push_front(entry);
        self.index.insert(
            key.clone(),
            Location {
                queue: Queue::Frequent,
                idx,
            },
        );
        Some(page)
    }

    fn evict_one(&mut self) -> Option<PageKey> {
        let entry = self.once.pop_back().or_else(|| self.frequent.pop_back())?;
        self.index.remove(&entry.key);
        Some(entry.key)
    }
}

/// Point-in-time cache counters. Reading them never reorders entries.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub once_len: usize,
    pub frequent_len: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct PageCache {
    capacity: usize,
    state: RwLock<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl PageCache {
    /// A cache holding at most `capacity` pages (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: RwLock::new(CacheState {
                index: HashMap::new(),
                once: RecencyList::new(),
                frequent: RecencyList::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// A cache sized from a byte budget.
    pub fn with_byte_budget(bytes: usize, page_size: usize) -> Self {
        Self::new(bytes / page_size.max(1))
    }

    pub fn get(&self, key: &PageKey) -> Option<PageRef> {
        let mut state = self.state.write();
        let hit = state.promote(key, None);

        match &hit {
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(page = %key, "Cache hit");
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        hit
    }

    /// Inserts or refreshes a page. Returns the key evicted to make room, if any.
    pub fn put(&self, key: PageKey, page: PageRef) -> Option<PageKey> {
        let mut state = self.state.write();

        if state.index.contains_key(&key) {
            state.promote(&key, Some(page));
            return None;
        }

        let idx = state.once.push_front(CacheEntry {
            key: key.clone(),
            page,
        });
        state.index.insert(
            key,
            Location {
                queue: Queue::Once,
                idx,
            },
        );

        if state.index.len() <= self.capacity {
            return None;
        }

        let evicted = state.evict_one();
        if let Some(victim) = &evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(page = %victim, "Evicted page from cache");
        }
        evicted
    }

    pub fn remove(&self, key: &PageKey) -> Option<PageRef> {
        self.state.write().detach(key).map(|entry| entry.page)
    }

    /// Drops every cached page of an array. Returns how many were removed.
    pub fn remove_array(&self, array: &ArrayId) -> usize {
        let mut state = self.state.write();
        let keys: Vec<PageKey> = state
            .index
            .keys()
            .filter(|key| &key.array == array)
            .cloned()
            .collect();
        keys.iter().filter(|key| state.detach(key).is_some()).count()
    }

    /// Checks membership without touching recency.
    pub fn contains(&self, key: &PageKey) -> bool {
        self.state.read().index.contains_key(key)
    }

    /// Which list holds the key, without touching recency.
    pub fn queue_of(&self, key: &PageKey) -> Option<Queue> {
        self.state.read().index.get(key).map(|loc| loc.queue)
    }

    /// Keys of one list from front to back.
    pub fn keys_in(&self, queue: Queue) -> Vec<PageKey> {
        let state = self.state.read();
        let list = match queue {
            Queue::Once => &state.once,
            Queue::Frequent => &state.frequent,
        };
        list.iter().map(|entry| entry.key.clone()).collect()
    }

    pub fn size(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        CacheStats {
            size: state.index.len(),
            capacity: self.capacity,
            once_len: state.once.len(),
            frequent_len: state.frequent.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
impl PageCache {
    fn peek(&self, key: &PageKey) -> Option<PageRef> {
        let state = self.state.read();
        let location = state.index.get(key)?;
        let list = match location.queue {
            Queue::Once => &state.once,
            Queue::Frequent => &state.frequent,
        };
        list.get(location.idx).map(|entry| entry.page.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsm::page::Page;

    fn key(page: u32) -> PageKey {
        PageKey::new(ArrayId::from("a"), page)
    }

    fn page(id: u32) -> PageRef {
        Page::new(id, 16).into_ref()
    }

    #[test]
    fn test_recency_list_reuses_slots() {
        let mut list = RecencyList::new();
        let a = list.push_front(1);
        let b = list.push_front(2);
        assert_eq!(list.remove(a), Some(1));
        let c = list.push_front(3);

        assert_eq!(c, a);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(list.pop_back(), Some(2));
        assert_eq!(list.remove(b), None);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_put_existing_entry_promotes_and_replaces_page() {
        let cache = PageCache::new(4);
        cache.put(key(0), page(0));
        let replacement = page(0);
        replacement.write().version = 9;

        assert!(cache.put(key(0), replacement).is_none());

        assert_eq!(cache.queue_of(&key(0)), Some(Queue::Frequent));
        assert_eq!(cache.peek(&key(0)).unwrap().read().version, 9);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_frequent_hit_moves_to_front() {
        let cache = PageCache::new(4);
        for p in 0..3 {
            cache.put(key(p), page(p));
            cache.get(&key(p));
        }
        assert_eq!(cache.keys_in(Queue::Frequent), vec![key(2), key(1), key(0)]);

        cache.get(&key(0));
        assert_eq!(cache.keys_in(Queue::Frequent), vec![key(0), key(2), key(1)]);
    }
}
