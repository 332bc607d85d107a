//! Handle identity cache.
//!
//! Remembers the `(child, parent, name)` triple of every object resolved
//! through a backend and refuses any later claim that gives the same child
//! handle a different ancestry. Such a claim means the driver duplicated an
//! identity, which cannot be repaired from here.

use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, error};

use crate::config::CorruptionPolicy;
use crate::error::{BackendCorruption, CorruptionKind};
use crate::handle::ObjectHandle;

/// Identity of one object as first observed during lookup. Never modified
/// once inserted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleCacheRecord {
    pub child: ObjectHandle,
    /// [`ObjectHandle::ROOT_PARENT`] for the export root.
    pub parent: ObjectHandle,
    pub name: String,
}

/// Process-wide (per backend) record of observed identities.
#[derive(Default)]
pub struct HandleCache {
    records: Mutex<HashMap<ObjectHandle, HandleCacheRecord>>,
}

impl HandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers that `child` was found as `name` under `parent` (`None` for
    /// the export root).
    ///
    /// A repeated identical claim is a no-op. `"."` is never stored. For
    /// `".."`, `child` is the presented grandparent and is checked against the
    /// recorded parent of `parent`; an unknown `parent` is silently accepted.
    pub fn record(
        &self,
        parent: Option<&ObjectHandle>,
        child: &ObjectHandle,
        name: &str,
    ) -> Result<(), BackendCorruption> {
        let presented_parent = parent.copied().unwrap_or(ObjectHandle::ROOT_PARENT);
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());

        match name {
            "." => return Ok(()),
            ".." => {
                let Some(known) = records.get(&presented_parent) else {
                    debug!("no identity cached for {presented_parent}, skipping \"..\" check");
                    return Ok(());
                };
                // The root's ".." resolves to the root itself.
                let matches = if known.parent.is_root_parent() {
                    *child == known.child
                } else {
                    *child == known.parent
                };
                if matches {
                    return Ok(());
                }
                return Err(BackendCorruption {
                    kind: CorruptionKind::DotDotMismatch,
                    child: known.child,
                    cached_parent: Some(known.parent),
                    cached_name: Some(known.name.clone()),
                    parent: Some(*child),
                    name: name.to_string(),
                });
            }
            _ => {}
        }

        if parent.is_some_and(|p| p == child) {
            return Err(BackendCorruption {
                kind: CorruptionKind::SelfParent,
                child: *child,
                cached_parent: None,
                cached_name: None,
                parent: parent.copied(),
                name: name.to_string(),
            });
        }

        if let Some(existing) = records.get(child) {
            if existing.parent == presented_parent && existing.name == name {
                return Ok(());
            }
            return Err(BackendCorruption {
                kind: CorruptionKind::DuplicateHandle,
                child: *child,
                cached_parent: Some(existing.parent),
                cached_name: Some(existing.name.clone()),
                parent: parent.copied(),
                name: name.to_string(),
            });
        }

        records.insert(
            *child,
            HandleCacheRecord {
                child: *child,
                parent: presented_parent,
                name: name.to_string(),
            },
        );
        Ok(())
    }

    pub fn get(&self, child: &ObjectHandle) -> Option<HandleCacheRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(child).cloned()
    }

    /// Drops the identity of an object whose name binding this server knows
    /// to have changed, so the next lookup registers the new one.
    pub fn forget(&self, child: &ObjectHandle) -> Option<HandleCacheRecord> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.remove(child)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Teardown when the owning backend goes away.
    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Logs a detected identity violation and applies `policy`. Under
/// [`CorruptionPolicy::Abort`] this does not return.
pub fn escalate(policy: CorruptionPolicy, corruption: BackendCorruption) -> BackendCorruption {
    error!("{corruption}");
    match policy {
        CorruptionPolicy::Abort => {
            error!("refusing to serve with a corrupted handle space, aborting");
            log::logger().flush();
            std::process::abort();
        }
        CorruptionPolicy::Reject => corruption,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(tag: &str) -> ObjectHandle {
        ObjectHandle::padded(tag.as_bytes())
    }

    #[test]
    fn test_record_is_idempotent() {
        let cache = HandleCache::new();
        cache.record(Some(&h("A")), &h("X"), "f1").unwrap();
        cache.record(Some(&h("A")), &h("X"), "f1").unwrap();
        assert_eq!(cache.len(), 1);
        let rec = cache.get(&h("X")).unwrap();
        assert_eq!(rec.parent, h("A"));
        assert_eq!(rec.name, "f1");
    }

    #[test]
    fn test_conflicting_parent_or_name() {
        let cache = HandleCache::new();
        cache.record(Some(&h("A")), &h("X"), "f1").unwrap();

        let e = cache.record(Some(&h("B")), &h("X"), "f1").unwrap_err();
        assert_eq!(e.kind, CorruptionKind::DuplicateHandle);
        assert_eq!(e.cached_parent, Some(h("A")));

        let e = cache.record(Some(&h("A")), &h("X"), "f2").unwrap_err();
        assert_eq!(e.kind, CorruptionKind::DuplicateHandle);
        assert_eq!(e.cached_name.as_deref(), Some("f1"));

        let e = cache.record(None, &h("X"), "f1").unwrap_err();
        assert_eq!(e.cached_parent, Some(h("A")));
        assert_eq!(e.parent, None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_self_parent() {
        let cache = HandleCache::new();
        let e = cache.record(Some(&h("X")), &h("X"), "loop").unwrap_err();
        assert_eq!(e.kind, CorruptionKind::SelfParent);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_root_recorded_once() {
        let cache = HandleCache::new();
        cache.record(None, &h("R"), "").unwrap();
        cache.record(None, &h("R"), "").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&h("R")).unwrap().parent.is_root_parent());
    }

    #[test]
    fn test_dot_entries_never_stored() {
        let cache = HandleCache::new();
        cache.record(Some(&h("D")), &h("D"), ".").unwrap();
        cache.record(Some(&h("D")), &h("P"), "..").unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_dotdot_verifies_grandparent() {
        let cache = HandleCache::new();
        cache.record(None, &h("R"), "").unwrap();
        cache.record(Some(&h("R")), &h("D"), "dir").unwrap();

        cache.record(Some(&h("D")), &h("R"), "..").unwrap();
        cache.record(Some(&h("R")), &h("R"), "..").unwrap();

        let e = cache.record(Some(&h("D")), &h("Z"), "..").unwrap_err();
        assert_eq!(e.kind, CorruptionKind::DotDotMismatch);
        assert_eq!(e.cached_parent, Some(h("R")));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_forget_allows_rebinding() {
        let cache = HandleCache::new();
        cache.record(Some(&h("A")), &h("X"), "f1").unwrap();
        assert!(cache.forget(&h("X")).is_some());
        cache.record(Some(&h("B")), &h("X"), "f2").unwrap();
        assert_eq!(cache.get(&h("X")).unwrap().parent, h("B"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_escalate_reject_returns_error() {
        let err = BackendCorruption {
            kind: CorruptionKind::SelfParent,
            child: h("X"),
            cached_parent: None,
            cached_name: None,
            parent: Some(h("X")),
            name: "x".to_string(),
        };
        let back = escalate(CorruptionPolicy::Reject, err.clone());
        assert_eq!(back, err);
    }
}
