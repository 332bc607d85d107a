//! Backend object identities.
//!
//! An [`ObjectHandle`] is the opaque byte identity a backend driver hands out
//! for a filesystem object. Nothing outside the driver that produced it looks
//! at its internals; the cache layers only compare bytes and hash them.

use std::fmt;

use sha2::{Digest, Sha256};

/// Length of every handle produced by a backend, in bytes.
pub const HANDLE_LEN: usize = 32;

/// Opaque, fixed-length identity of a backend object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle([u8; HANDLE_LEN]);

impl ObjectHandle {
    /// Reserved value standing for "the parent of the export root", which does
    /// not exist. Backends never hand this out.
    pub const ROOT_PARENT: ObjectHandle = ObjectHandle([0u8; HANDLE_LEN]);

    pub const fn from_bytes(bytes: [u8; HANDLE_LEN]) -> Self {
        ObjectHandle(bytes)
    }

    /// Builds a handle from a slice of exactly [`HANDLE_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; HANDLE_LEN]>::try_from(bytes).ok().map(ObjectHandle)
    }

    /// Zero-padded handle for unit tests.
    #[cfg(test)]
    pub(crate) fn padded(bytes: &[u8]) -> Self {
        let mut out = [0u8; HANDLE_LEN];
        out[..bytes.len()].copy_from_slice(bytes);
        ObjectHandle(out)
    }

    pub fn as_bytes(&self) -> &[u8; HANDLE_LEN] {
        &self.0
    }

    pub fn is_root_parent(&self) -> bool {
        *self == Self::ROOT_PARENT
    }

    pub fn digest(&self) -> HandleDigest {
        HandleDigest::of(self)
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHandle({})", hex::encode(self.0))
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// SHA-256 digest of a handle, used as the key of the entry table.
///
/// Two handles may in principle share a digest, so a digest match alone is
/// never proof of identity; lookups always re-compare the full handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleDigest([u8; 32]);

impl HandleDigest {
    pub fn of(handle: &ObjectHandle) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(handle.as_bytes());
        HandleDigest(hasher.finalize().into())
    }

    pub const fn from_raw(raw: [u8; 32]) -> Self {
        HandleDigest(raw)
    }
}

impl fmt::Debug for HandleDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleDigest({})", hex::encode(&self.0[..8]))
    }
}
