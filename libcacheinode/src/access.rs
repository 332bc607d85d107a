//! Permission checks for attribute changes and renames.
//!
//! These run against the attributes the cache currently holds, before the
//! request reaches the backend. The backend may still refuse on its own.

use log::debug;

use crate::config::FsInfo;
use crate::error::CacheError;
use crate::models::{AttrMask, AttrSet, Attributes, Credentials, ObjectType};

const S_ISVTX: u32 = 0o1000;
const MODE_BITS: u32 = 0o7777;

pub const MAY_READ: u32 = 0o4;
pub const MAY_WRITE: u32 = 0o2;
pub const MAY_EXEC: u32 = 0o1;

/// Whether `creds` hold every permission in `want` (`MAY_*` bits) on an
/// object with attributes `attrs`, by mode bits alone.
pub fn mode_allows(creds: &Credentials, attrs: &Attributes, want: u32) -> bool {
    if creds.is_root() {
        return true;
    }
    let shift = if creds.uid == attrs.owner {
        6
    } else if creds.in_group(attrs.group) {
        3
    } else {
        0
    };
    (attrs.mode >> shift) & want == want
}

/// Validates a setattr request and returns the attributes that should
/// actually be sent to the backend.
///
/// The umask is applied to a new mode, and a mode change on a symbolic link
/// is silently dropped.
pub fn check_setattr(
    creds: &Credentials,
    current: &Attributes,
    wanted: &AttrSet,
    fs_info: &FsInfo,
) -> Result<AttrSet, CacheError> {
    let mask = wanted.mask();
    if mask.intersects(AttrMask::IMMUTABLE) {
        return Err(CacheError::InvalidArgument(format!(
            "cannot set {:?}",
            mask & AttrMask::IMMUTABLE
        )));
    }
    if !fs_info.can_set_time && mask.intersects(AttrMask::TIMES) {
        return Err(CacheError::InvalidArgument(
            "filesystem does not allow setting times".to_string(),
        ));
    }

    if let Some(size) = wanted.size {
        if size > fs_info.max_file_size {
            return Err(CacheError::FileTooLarge(size));
        }
    }

    let privileged = creds.is_root();
    let is_owner = creds.uid == current.owner;
    let mut checked = wanted.clone();

    if let Some(mode) = checked.mode {
        if current.object_type == ObjectType::Symlink {
            debug!("ignoring chmod on a symbolic link");
            checked.mode = None;
        } else if !privileged && !is_owner {
            return Err(CacheError::Permission);
        } else {
            checked.mode = Some(mode & !fs_info.umask & MODE_BITS);
        }
    }

    if let Some(owner) = checked.owner {
        // Only root gives files away; the owner may "chown" to itself.
        if !privileged && !(is_owner && owner == creds.uid) {
            return Err(CacheError::Permission);
        }
    }

    if let Some(group) = checked.group {
        if !privileged && !(is_owner && creds.in_group(group)) {
            return Err(CacheError::Permission);
        }
    }

    if checked.atime.is_some() && !privileged && !is_owner && !mode_allows(creds, current, MAY_READ)
    {
        return Err(CacheError::Access);
    }
    if checked.mtime.is_some()
        && !privileged
        && !is_owner
        && !mode_allows(creds, current, MAY_WRITE)
    {
        return Err(CacheError::Access);
    }

    Ok(checked)
}

/// Checks that `creds` may move `victim` out of `src_dir` into `tgt_dir`,
/// replacing `existing` if the target name is taken.
pub fn check_rename(
    creds: &Credentials,
    src_dir: &Attributes,
    tgt_dir: &Attributes,
    victim: &Attributes,
    existing: Option<&Attributes>,
    fs_info: &FsInfo,
) -> Result<(), CacheError> {
    if !src_dir.is_dir() || !tgt_dir.is_dir() {
        return Err(CacheError::NotDirectory);
    }
    if !mode_allows(creds, src_dir, MAY_WRITE | MAY_EXEC) {
        return Err(CacheError::Access);
    }
    if !mode_allows(creds, tgt_dir, MAY_WRITE | MAY_EXEC) {
        return Err(CacheError::Access);
    }
    if let Some(existing) = existing {
        if existing.is_dir() != victim.is_dir() {
            return Err(CacheError::InvalidArgument(
                "cannot replace a directory with a non-directory or vice versa".to_string(),
            ));
        }
    }

    if !fs_info.dirs_have_sticky_bit || creds.is_root() {
        return Ok(());
    }
    let sticky_denies = |dir: &Attributes, obj: &Attributes| {
        dir.mode & S_ISVTX != 0 && dir.owner != creds.uid && obj.owner != creds.uid
    };
    if sticky_denies(src_dir, victim) {
        return Err(CacheError::Access);
    }
    if existing.is_some_and(|e| sticky_denies(tgt_dir, e)) {
        return Err(CacheError::Access);
    }
    Ok(())
}
