//! Cached object metadata.

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bitflags::bitflags;

use crate::backend::FileId;
use crate::handle::{HandleDigest, ObjectHandle};
use crate::models::{Attributes, ObjectType};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// Cached attributes may be served without asking the backend.
        const TRUST_CONTENT = 1;
        /// Directory listing is fully cached.
        const DIR_POPULATED = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidateMode {
    /// Drop the trust flags only.
    ClearBits,
    /// Also forget any cached open-file state.
    Close,
}

/// Mutable part of an entry, guarded by the entry lock.
#[derive(Debug)]
pub struct EntryState {
    pub attrs: Attributes,
    pub open_file: Option<FileId>,
}

#[derive(Debug)]
pub struct CacheEntry {
    handle: ObjectHandle,
    digest: HandleDigest,
    object_type: ObjectType,
    refcount: AtomicUsize,
    flags: AtomicU32,
    /// Bumped under the entry lock whenever cached state is invalidated or
    /// changed by an upcall.
    generation: AtomicU64,
    state: RwLock<EntryState>,
}

impl CacheEntry {
    pub(crate) fn new(handle: ObjectHandle, attrs: Attributes) -> Self {
        CacheEntry {
            handle,
            digest: handle.digest(),
            object_type: attrs.object_type,
            refcount: AtomicUsize::new(0),
            flags: AtomicU32::new(EntryFlags::TRUST_CONTENT.bits()),
            generation: AtomicU64::new(0),
            state: RwLock::new(EntryState {
                attrs,
                open_file: None,
            }),
        }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    pub fn digest(&self) -> HandleDigest {
        self.digest
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub fn is_dir(&self) -> bool {
        self.object_type == ObjectType::Directory
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_trusted(&self) -> bool {
        self.flags().contains(EntryFlags::TRUST_CONTENT)
    }

    pub fn set_flags(&self, flags: EntryFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: EntryFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Read before fetching attributes from the backend and handed back to
    /// [`EntryRef::refresh_if_unchanged`].
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Must be called with the entry lock held.
    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Flags that an attribute change invalidates for this kind of object.
    pub fn stale_flags(&self) -> EntryFlags {
        if self.is_dir() {
            EntryFlags::TRUST_CONTENT | EntryFlags::DIR_POPULATED
        } else {
            EntryFlags::TRUST_CONTENT
        }
    }

    /// Snapshot of the cached attributes.
    pub fn attributes(&self) -> Attributes {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .attrs
            .clone()
    }

    pub(crate) fn pin(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "entry unpinned more often than pinned");
    }
}

/// A pinned reference to a [`CacheEntry`]. The entry cannot be reclaimed
/// while any `EntryRef` to it is alive; dropping the last one makes it
/// eligible again.
#[derive(Debug)]
pub struct EntryRef {
    entry: Arc<CacheEntry>,
}

impl EntryRef {
    pub(crate) fn pin(entry: &Arc<CacheEntry>) -> Self {
        entry.pin();
        EntryRef {
            entry: entry.clone(),
        }
    }

    /// Runs `f` with the entry lock held exclusively. `f` must not perform
    /// backend I/O.
    pub fn with_write_lock<R>(&self, f: impl FnOnce(&mut EntryState) -> R) -> R {
        let mut guard = self
            .entry
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn with_read_lock<R>(&self, f: impl FnOnce(&EntryState) -> R) -> R {
        let guard = self
            .entry
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Installs attributes fetched from the backend and trusts them again,
    /// unless the entry was invalidated or updated since `seen` was read from
    /// [`CacheEntry::generation`]. Returns whether the snapshot was installed.
    pub fn refresh_if_unchanged(&self, attrs: Attributes, seen: u64) -> bool {
        self.with_write_lock(|state| {
            if self.entry.generation() != seen {
                return false;
            }
            state.attrs = attrs;
            self.entry.set_flags(EntryFlags::TRUST_CONTENT);
            true
        })
    }

    pub fn invalidate(&self, mode: InvalidateMode) {
        self.with_write_lock(|state| {
            self.entry.bump_generation();
            self.entry.clear_flags(EntryFlags::TRUST_CONTENT | EntryFlags::DIR_POPULATED);
            if mode == InvalidateMode::Close {
                state.open_file = None;
            }
        });
    }
}

impl Clone for EntryRef {
    fn clone(&self) -> Self {
        EntryRef::pin(&self.entry)
    }
}

impl Deref for EntryRef {
    type Target = CacheEntry;

    fn deref(&self) -> &CacheEntry {
        &self.entry
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        self.entry.unpin();
    }
}
