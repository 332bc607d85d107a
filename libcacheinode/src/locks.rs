//! Relay of backend lock notifications to the blocking-lock layer.
//!
//! Scheduling of blocked POSIX locks is not done here; the cache only hands
//! "granted" and "now available" notifications for a pinned entry to
//! whichever component owns the lock queues.

use std::sync::{Mutex, PoisonError};

use crate::entry::EntryRef;
use crate::handle::ObjectHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
}

/// Byte range and mode of a lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockParam {
    pub lock_type: LockType,
    pub start: u64,
    /// Zero means "to end of file".
    pub length: u64,
}

/// Opaque lock owner as understood by the state layer.
pub type LockOwner = u64;

pub trait BlockingLockRelay: Send + Sync {
    /// The backend granted a lock the owner was blocked on.
    fn grant(&self, entry: &EntryRef, owner: LockOwner, lock: &LockParam);

    /// A conflicting lock went away; the owner may retry.
    fn available(&self, entry: &EntryRef, owner: LockOwner, lock: &LockParam);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockNotificationKind {
    Granted,
    Available,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockNotification {
    pub kind: LockNotificationKind,
    pub handle: ObjectHandle,
    pub owner: LockOwner,
    pub lock: LockParam,
}

/// Relay that parks notifications until the state layer drains them.
#[derive(Default)]
pub struct PendingLockNotifications {
    pending: Mutex<Vec<LockNotification>>,
}

impl PendingLockNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<LockNotification> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn push(&self, kind: LockNotificationKind, entry: &EntryRef, owner: LockOwner, lock: &LockParam) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LockNotification {
                kind,
                handle: *entry.handle(),
                owner,
                lock: *lock,
            });
    }
}

impl BlockingLockRelay for PendingLockNotifications {
    fn grant(&self, entry: &EntryRef, owner: LockOwner, lock: &LockParam) {
        self.push(LockNotificationKind::Granted, entry, owner, lock);
    }

    fn available(&self, entry: &EntryRef, owner: LockOwner, lock: &LockParam) {
        self.push(LockNotificationKind::Available, entry, owner, lock);
    }
}
