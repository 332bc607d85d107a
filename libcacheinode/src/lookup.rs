//! Name resolution against a backend, with identity checking.

use std::sync::Arc;

use log::{debug, warn};

use crate::backend::Backend;
use crate::config::{CorruptionPolicy, FsInfo};
use crate::error::CacheError;
use crate::handle::ObjectHandle;
use crate::handle_cache::{HandleCache, escalate};
use crate::models::{FetchedAttrs, LookupReply, ObjectType};

pub struct Resolver {
    backend: Arc<dyn Backend>,
    handles: Arc<HandleCache>,
    policy: CorruptionPolicy,
    fs_info: FsInfo,
}

impl Resolver {
    pub fn new(
        backend: Arc<dyn Backend>,
        handles: Arc<HandleCache>,
        policy: CorruptionPolicy,
        fs_info: FsInfo,
    ) -> Self {
        Resolver {
            backend,
            handles,
            policy,
            fs_info,
        }
    }

    /// Resolves `name` in `parent`, or the export root when both are `None`.
    ///
    /// Every returned handle has been checked against the identity cache.
    /// With `want_attrs`, the child's attributes are fetched as well; failing
    /// to read them does not fail the lookup.
    pub async fn lookup(
        &self,
        parent: Option<&ObjectHandle>,
        name: Option<&str>,
        want_attrs: bool,
    ) -> Result<LookupReply, CacheError> {
        let (parent, name) = match (parent, name) {
            (None, None) => return self.lookup_root(want_attrs).await,
            (Some(parent), Some(name)) => (parent, name),
            _ => return Err(CacheError::InputFault("parent and name must be given together")),
        };
        self.check_name(name)?;

        let parent_attrs = self.backend.get_attributes(parent).await?;
        match parent_attrs.object_type {
            ObjectType::Directory => {}
            ObjectType::Junction => return Err(CacheError::CrossDevice),
            ObjectType::RegularFile | ObjectType::Symlink | ObjectType::ExtendedAttribute => {
                return Err(CacheError::NotDirectory);
            }
            other => {
                return Err(CacheError::ServerFault(format!(
                    "unexpected parent object type {other:?}"
                )));
            }
        }

        let child = self.backend.lookup(parent, name).await?;
        self.register(Some(parent), &child, name)?;

        let attrs = if want_attrs {
            Some(self.fetch_attrs(&child).await)
        } else {
            None
        };
        Ok(LookupReply {
            handle: child,
            attrs,
        })
    }

    async fn lookup_root(&self, want_attrs: bool) -> Result<LookupReply, CacheError> {
        let root = self.backend.lookup_root().await?;
        self.register(None, &root, "")?;
        let attrs = if want_attrs {
            Some(self.fetch_attrs(&root).await)
        } else {
            None
        };
        Ok(LookupReply { handle: root, attrs })
    }

    fn check_name(&self, name: &str) -> Result<(), CacheError> {
        if name.is_empty() {
            return Err(CacheError::InvalidArgument("empty name".to_string()));
        }
        if name.len() > self.fs_info.max_name_len {
            return Err(CacheError::InvalidArgument(format!(
                "name longer than {} bytes",
                self.fs_info.max_name_len
            )));
        }
        if name.contains('/') {
            return Err(CacheError::InvalidArgument(format!("{name:?} contains '/'")));
        }
        Ok(())
    }

    fn register(
        &self,
        parent: Option<&ObjectHandle>,
        child: &ObjectHandle,
        name: &str,
    ) -> Result<(), CacheError> {
        self.handles
            .record(parent, child, name)
            .map_err(|corruption| CacheError::Corruption(escalate(self.policy, corruption)))
    }

    pub(crate) async fn fetch_attrs(&self, handle: &ObjectHandle) -> FetchedAttrs {
        match self.backend.get_attributes(handle).await {
            Ok(attrs) => FetchedAttrs::Attrs(attrs),
            Err(e) if e.retryable => {
                warn!("attributes of {handle} unavailable: {e}");
                FetchedAttrs::Unreadable
            }
            Err(e) => {
                debug!("attributes of {handle} unreadable: {e}");
                FetchedAttrs::Unreadable
            }
        }
    }
}
