use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::handle::ObjectHandle;

/// Kind of filesystem object as reported by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    RegularFile,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Socket,
    Fifo,
    /// Namespace boundary, resolution continues in another export.
    Junction,
    ExtendedAttribute,
}

/// Timestamp with nanosecond resolution.
///
/// Ordering is lexicographic on `(seconds, nanoseconds)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FsTime {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl FsTime {
    pub const fn new(seconds: u64, nanoseconds: u32) -> Self {
        FsTime {
            seconds,
            nanoseconds,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AceType {
    Allow,
    Deny,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ace {
    pub kind: AceType,
    pub who: u32,
    pub mask: u32,
}

/// Shared NFSv4-style access control list. Entries hold one reference each;
/// dropping the last `Acl` frees the list.
pub type Acl = Arc<Vec<Ace>>;

/// Full attribute set of a backend object.
#[derive(Clone, Debug, PartialEq)]
pub struct Attributes {
    pub object_type: ObjectType,
    pub fsid: (u64, u64),
    pub fileid: u64,
    pub rawdev: (u32, u32),
    pub generation: u64,
    pub size: u64,
    pub space_used: u64,
    pub acl: Option<Acl>,
    pub mode: u32,
    pub owner: u32,
    pub group: u32,
    pub numlinks: u32,
    pub atime: FsTime,
    pub ctime: FsTime,
    pub mtime: FsTime,
    pub creation: FsTime,
    pub chgtime: FsTime,
    /// Change counter, bumped by the backend on every modification.
    pub change: u64,
}

impl Attributes {
    /// A zeroed attribute set of the given type, mostly useful for tests and
    /// in-memory drivers.
    pub fn new(object_type: ObjectType, fileid: u64) -> Self {
        Attributes {
            object_type,
            fsid: (0, 0),
            fileid,
            rawdev: (0, 0),
            generation: 0,
            size: 0,
            space_used: 0,
            acl: None,
            mode: 0,
            owner: 0,
            group: 0,
            numlinks: 1,
            atime: FsTime::default(),
            ctime: FsTime::default(),
            mtime: FsTime::default(),
            creation: FsTime::default(),
            chgtime: FsTime::default(),
            change: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.object_type == ObjectType::Directory
    }
}

bitflags! {
    /// Which attributes an [`AttrSet`] carries.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AttrMask: u32 {
        const TYPE = 1;
        const FSID = 1 << 1;
        const FILEID = 1 << 2;
        const RAWDEV = 1 << 3;
        const GENERATION = 1 << 4;
        const RDATTR_ERR = 1 << 5;
        const SIZE = 1 << 6;
        const SPACEUSED = 1 << 7;
        const ACL = 1 << 8;
        const MODE = 1 << 9;
        const OWNER = 1 << 10;
        const GROUP = 1 << 11;
        const NUMLINKS = 1 << 12;
        const ATIME = 1 << 13;
        const CTIME = 1 << 14;
        const MTIME = 1 << 15;
        const CREATION = 1 << 16;
        const CHGTIME = 1 << 17;
        const CHANGE = 1 << 18;
    }
}

impl AttrMask {
    /// Attributes whose change means the object was destroyed and recreated.
    pub const IMMUTABLE: AttrMask = AttrMask::TYPE
        .union(AttrMask::FSID)
        .union(AttrMask::FILEID)
        .union(AttrMask::RAWDEV)
        .union(AttrMask::RDATTR_ERR)
        .union(AttrMask::GENERATION);

    pub const TIMES: AttrMask = AttrMask::ATIME
        .union(AttrMask::CTIME)
        .union(AttrMask::MTIME)
        .union(AttrMask::CREATION);
}

/// A partial set of attributes, as carried by setattr requests and upcall
/// updates. Absent fields are left alone.
#[derive(Clone, Debug, Default)]
pub struct AttrSet {
    pub object_type: Option<ObjectType>,
    pub fsid: Option<(u64, u64)>,
    pub fileid: Option<u64>,
    pub rawdev: Option<(u32, u32)>,
    pub generation: Option<u64>,
    pub rdattr_err: bool,
    pub size: Option<u64>,
    pub space_used: Option<u64>,
    /// `Some(None)` removes the ACL.
    pub acl: Option<Option<Acl>>,
    pub mode: Option<u32>,
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub numlinks: Option<u32>,
    pub atime: Option<FsTime>,
    pub ctime: Option<FsTime>,
    pub mtime: Option<FsTime>,
    pub creation: Option<FsTime>,
    pub chgtime: Option<FsTime>,
    pub change: Option<u64>,
}

impl AttrSet {
    pub fn mask(&self) -> AttrMask {
        let mut mask = AttrMask::empty();
        let fields = [
            (self.object_type.is_some(), AttrMask::TYPE),
            (self.fsid.is_some(), AttrMask::FSID),
            (self.fileid.is_some(), AttrMask::FILEID),
            (self.rawdev.is_some(), AttrMask::RAWDEV),
            (self.generation.is_some(), AttrMask::GENERATION),
            (self.rdattr_err, AttrMask::RDATTR_ERR),
            (self.size.is_some(), AttrMask::SIZE),
            (self.space_used.is_some(), AttrMask::SPACEUSED),
            (self.acl.is_some(), AttrMask::ACL),
            (self.mode.is_some(), AttrMask::MODE),
            (self.owner.is_some(), AttrMask::OWNER),
            (self.group.is_some(), AttrMask::GROUP),
            (self.numlinks.is_some(), AttrMask::NUMLINKS),
            (self.atime.is_some(), AttrMask::ATIME),
            (self.ctime.is_some(), AttrMask::CTIME),
            (self.mtime.is_some(), AttrMask::MTIME),
            (self.creation.is_some(), AttrMask::CREATION),
            (self.chgtime.is_some(), AttrMask::CHGTIME),
            (self.change.is_some(), AttrMask::CHANGE),
        ];
        for (present, bit) in fields {
            if present {
                mask |= bit;
            }
        }
        mask
    }

    pub fn is_empty(&self) -> bool {
        self.mask().is_empty()
    }
}

/// Caller identity attached to a request.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    /// Supplementary groups.
    pub groups: Vec<u32>,
}

impl Credentials {
    pub const ROOT_UID: u32 = 0;

    pub fn new(uid: u32, gid: u32) -> Self {
        Credentials {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid == Self::ROOT_UID
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// Attributes returned alongside a lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchedAttrs {
    Attrs(Attributes),
    /// The object was found but its attributes could not be read.
    Unreadable,
}

#[derive(Clone, Debug)]
pub struct LookupReply {
    pub handle: ObjectHandle,
    pub attrs: Option<FetchedAttrs>,
}
