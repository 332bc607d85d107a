//! Upcalls: change notifications originated by a backend rather than by a
//! request this server issued.
//!
//! A driver describes each change as an [`UpcallEvent`] and hands it to the
//! [`UpcallBus`] (synchronously) or an [`UpcallQueue`] (fire-and-forget).
//! Updates carry new attribute values and are merged into the cached entry;
//! every other event only invalidates it.

mod bus;
mod queue;

use bitflags::bitflags;

use crate::entry::InvalidateMode;
use crate::handle::ObjectHandle;
use crate::locks::{LockOwner, LockParam};
use crate::models::AttrSet;

pub use bus::UpcallBus;
pub use queue::UpcallQueue;

bitflags! {
    /// Per-field "only move forward" markers of an update.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct UpdateFlags: u32 {
        const SIZE_INC = 0x0001;
        const ATIME_INC = 0x0002;
        const CREATION_INC = 0x0004;
        const CTIME_INC = 0x0008;
        const MTIME_INC = 0x0010;
        const CHGTIME_INC = 0x0020;
        const SPACEUSED_INC = 0x0040;
    }
}

#[derive(Clone, Debug)]
pub enum UpcallKind {
    Create,
    Unlink,
    Rename,
    Commit,
    Write,
    Link,
    LockGrant { owner: LockOwner, lock: LockParam },
    LockAvail { owner: LockOwner, lock: LockParam },
    Open,
    Close,
    SetAttr,
    /// `flags` may carry bits outside [`UpdateFlags::all`]; such updates are
    /// rejected.
    Update { attrs: AttrSet, flags: UpdateFlags },
    Invalidate { mode: InvalidateMode },
}

#[derive(Clone, Debug)]
pub struct UpcallEvent {
    pub target: ObjectHandle,
    pub kind: UpcallKind,
}

impl UpcallEvent {
    pub fn new(target: ObjectHandle, kind: UpcallKind) -> Self {
        UpcallEvent { target, kind }
    }

    pub fn update(target: ObjectHandle, attrs: AttrSet, flags: UpdateFlags) -> Self {
        Self::new(target, UpcallKind::Update { attrs, flags })
    }

    pub fn invalidate(target: ObjectHandle) -> Self {
        Self::new(
            target,
            UpcallKind::Invalidate {
                mode: InvalidateMode::ClearBits,
            },
        )
    }
}
