//! Digest-keyed table of cache entries.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::entry::{CacheEntry, EntryRef};
use crate::handle::{HandleDigest, ObjectHandle};
use crate::models::Attributes;

/// Entries sharing a digest live in one bucket and are told apart by their
/// full handle, so a digest collision degrades to a miss, never a false hit.
type Bucket = Vec<Arc<CacheEntry>>;

#[derive(Default)]
pub struct EntryStore {
    table: RwLock<HashMap<HandleDigest, Bucket>>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins and returns the entry for `handle`, if cached.
    pub fn get(&self, handle: &ObjectHandle) -> Option<EntryRef> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .get(&handle.digest())?
            .iter()
            .find(|e| e.handle() == handle)
            .map(EntryRef::pin)
    }

    /// Pins and returns the entry for `handle`, creating it from `attrs` on a
    /// miss. `attrs` is ignored when the entry already exists.
    pub fn get_or_insert(&self, handle: &ObjectHandle, attrs: Attributes) -> EntryRef {
        let digest = handle.digest();
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let bucket = table.entry(digest).or_default();
        if let Some(existing) = bucket.iter().find(|e| e.handle() == handle) {
            return EntryRef::pin(existing);
        }
        if !bucket.is_empty() {
            debug!("digest collision on {digest:?}, adding a second entry to the bucket");
        }
        let entry = Arc::new(CacheEntry::new(*handle, attrs));
        let pinned = EntryRef::pin(&entry);
        bucket.push(entry);
        pinned
    }

    pub fn contains(&self, handle: &ObjectHandle) -> bool {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .get(&handle.digest())
            .is_some_and(|b| b.iter().any(|e| e.handle() == handle))
    }

    pub fn len(&self) -> usize {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops unreferenced entries until at most `target` remain. Pinned
    /// entries are never removed. Returns the number of entries reclaimed.
    pub fn reclaim(&self, target: usize) -> usize {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut remaining: usize = table.values().map(Vec::len).sum();
        let mut reclaimed = 0;
        for bucket in table.values_mut() {
            if remaining <= target {
                break;
            }
            bucket.retain(|e| {
                if remaining > target && e.refcount() == 0 {
                    remaining -= 1;
                    reclaimed += 1;
                    false
                } else {
                    true
                }
            });
        }
        table.retain(|_, bucket| !bucket.is_empty());
        reclaimed
    }

    /// Periodically trims the table down to `hwmark` entries.
    pub fn spawn_reclaimer(self: Arc<Self>, hwmark: usize, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(period);
            loop {
                timer.tick().await;
                if self.len() > hwmark {
                    let n = self.reclaim(hwmark);
                    debug!("reclaimed {n} cache entries");
                }
            }
        })
    }
}
