use std::sync::Arc;

use log::{debug, info};

use crate::entry::{EntryRef, InvalidateMode};
use crate::error::UpcallError;
use crate::handle::ObjectHandle;
use crate::handle_cache::HandleCache;
use crate::locks::{BlockingLockRelay, LockOwner, LockParam};
use crate::models::{AttrMask, AttrSet, Attributes, FsTime};
use crate::store::EntryStore;

use super::{UpcallEvent, UpcallKind, UpdateFlags};

/// Applies upcall events to the entry store.
///
/// Every mutation happens under the target entry's write lock and the entry
/// stays pinned for the duration, so concurrent events for one object are
/// serialized while events for different objects proceed in parallel.
pub struct UpcallBus {
    store: Arc<EntryStore>,
    handles: Arc<HandleCache>,
    locks: Option<Arc<dyn BlockingLockRelay>>,
}

impl UpcallBus {
    pub fn new(store: Arc<EntryStore>, handles: Arc<HandleCache>) -> Self {
        UpcallBus {
            store,
            handles,
            locks: None,
        }
    }

    /// Forwards lock notifications to `relay` instead of merely invalidating.
    pub fn with_lock_relay(mut self, relay: Arc<dyn BlockingLockRelay>) -> Self {
        self.locks = Some(relay);
        self
    }

    pub fn apply(&self, event: UpcallEvent) -> Result<(), UpcallError> {
        let target = event.target;
        match event.kind {
            UpcallKind::Update { attrs, flags } => self.update(&target, attrs, flags),
            UpcallKind::Invalidate { mode } => self.invalidate(&target, mode),
            UpcallKind::LockGrant { owner, lock } => {
                self.relay_lock(&target, owner, &lock, |relay, entry| {
                    relay.grant(entry, owner, &lock)
                })
            }
            UpcallKind::LockAvail { owner, lock } => {
                self.relay_lock(&target, owner, &lock, |relay, entry| {
                    relay.available(entry, owner, &lock)
                })
            }
            UpcallKind::Unlink | UpcallKind::Rename => {
                // The name binding recorded at lookup no longer holds.
                self.handles.forget(&target);
                self.invalidate(&target, InvalidateMode::ClearBits)
            }
            UpcallKind::Create
            | UpcallKind::Commit
            | UpcallKind::Write
            | UpcallKind::Link
            | UpcallKind::Open
            | UpcallKind::Close
            | UpcallKind::SetAttr => self.invalidate(&target, InvalidateMode::ClearBits),
        }
    }

    /// Merges `update` into the cached attributes of `target`.
    ///
    /// Fields whose `*_INC` flag is set only move forward; all others are
    /// overwritten. The entry's trust flags are cleared whether or not any
    /// field actually changed.
    pub fn update(
        &self,
        target: &ObjectHandle,
        update: AttrSet,
        flags: UpdateFlags,
    ) -> Result<(), UpcallError> {
        let immutable = update.mask() & AttrMask::IMMUTABLE;
        if !immutable.is_empty() {
            debug!("upcall update for {target} tried to change {immutable:?}");
            return Err(UpcallError::InvalidArgument(format!(
                "immutable attributes {immutable:?}"
            )));
        }
        let unknown = flags.bits() & !UpdateFlags::all().bits();
        if unknown != 0 {
            return Err(UpcallError::InvalidArgument(format!(
                "unknown update flags {unknown:#x}"
            )));
        }

        let entry = self.store.get(target).ok_or(UpcallError::NotFound)?;
        let changed = entry.with_write_lock(|state| {
            let changed = merge(&mut state.attrs, update, flags);
            entry.bump_generation();
            entry.clear_flags(entry.stale_flags());
            changed
        });
        if changed {
            debug!("applied upcall update to {target}");
        } else {
            debug!("upcall update for {target} changed nothing");
        }
        Ok(())
    }

    /// Clears the trust flags of `target`. An uncached target is not an
    /// error: there is nothing stale to drop.
    pub fn invalidate(&self, target: &ObjectHandle, mode: InvalidateMode) -> Result<(), UpcallError> {
        match self.store.get(target) {
            Some(entry) => {
                entry.invalidate(mode);
                debug!("invalidated {target} ({mode:?})");
            }
            None => debug!("invalidate for uncached {target}"),
        }
        Ok(())
    }

    fn relay_lock(
        &self,
        target: &ObjectHandle,
        owner: LockOwner,
        lock: &LockParam,
        notify: impl FnOnce(&dyn BlockingLockRelay, &EntryRef),
    ) -> Result<(), UpcallError> {
        let Some(entry) = self.store.get(target) else {
            // Another node may hold the lock state.
            debug!("lock upcall for uncached {target}, owner {owner}");
            return Ok(());
        };
        match &self.locks {
            Some(relay) => {
                info!(
                    "relaying lock notification for {target}, owner {owner} range {}+{}",
                    lock.start, lock.length
                );
                notify(relay.as_ref(), &entry);
            }
            None => entry.invalidate(InvalidateMode::ClearBits),
        }
        Ok(())
    }
}

fn advance<T: PartialOrd>(current: &mut T, new: T, only_forward: bool) -> bool {
    if *current == new || (only_forward && new < *current) {
        return false;
    }
    *current = new;
    true
}

fn advance_time(current: &mut FsTime, new: Option<FsTime>, only_forward: bool) -> bool {
    new.is_some_and(|t| advance(current, t, only_forward))
}

/// Applies `update` to `attrs`, returning whether any field changed.
fn merge(attrs: &mut Attributes, update: AttrSet, flags: UpdateFlags) -> bool {
    let mut changed = false;

    if let Some(size) = update.size {
        changed |= advance(&mut attrs.size, size, flags.contains(UpdateFlags::SIZE_INC));
    }
    if let Some(used) = update.space_used {
        changed |= advance(
            &mut attrs.space_used,
            used,
            flags.contains(UpdateFlags::SPACEUSED_INC),
        );
    }
    if let Some(acl) = update.acl {
        // Release our reference to the old list before taking the new one.
        drop(attrs.acl.take());
        attrs.acl = acl;
        changed = true;
    }
    if let Some(mode) = update.mode {
        attrs.mode = mode;
        changed = true;
    }
    if let Some(numlinks) = update.numlinks {
        attrs.numlinks = numlinks;
        changed = true;
    }
    if let Some(owner) = update.owner {
        attrs.owner = owner;
        changed = true;
    }
    if let Some(group) = update.group {
        attrs.group = group;
        changed = true;
    }

    changed |= advance_time(&mut attrs.atime, update.atime, flags.contains(UpdateFlags::ATIME_INC));
    changed |= advance_time(
        &mut attrs.creation,
        update.creation,
        flags.contains(UpdateFlags::CREATION_INC),
    );
    changed |= advance_time(&mut attrs.ctime, update.ctime, flags.contains(UpdateFlags::CTIME_INC));
    changed |= advance_time(&mut attrs.mtime, update.mtime, flags.contains(UpdateFlags::MTIME_INC));
    changed |= advance_time(
        &mut attrs.chgtime,
        update.chgtime,
        flags.contains(UpdateFlags::CHGTIME_INC),
    );

    if let Some(change) = update.change {
        attrs.change = change;
        changed = true;
    }
    changed
}
