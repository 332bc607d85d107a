//! Protocol-handler-facing entry point.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::access;
use crate::backend::{Backend, FileId, OpenFlags, ReadReply};
use crate::config::CacheConfig;
use crate::entry::{EntryRef, InvalidateMode};
use crate::error::CacheError;
use crate::handle::ObjectHandle;
use crate::handle_cache::HandleCache;
use crate::locks::BlockingLockRelay;
use crate::lookup::Resolver;
use crate::models::{AttrSet, Attributes, Credentials, FetchedAttrs, LookupReply};
use crate::store::EntryStore;
use crate::upcall::{UpcallBus, UpcallQueue};

/// Identity-checked metadata cache in front of one backend.
pub struct CacheInode {
    backend: Arc<dyn Backend>,
    config: CacheConfig,
    handles: Arc<HandleCache>,
    store: Arc<EntryStore>,
    resolver: Resolver,
    bus: Arc<UpcallBus>,
}

impl CacheInode {
    pub fn new(backend: Arc<dyn Backend>, config: CacheConfig) -> Self {
        let handles = Arc::new(HandleCache::new());
        let store = Arc::new(EntryStore::new());
        let resolver = Resolver::new(
            backend.clone(),
            handles.clone(),
            config.corruption_policy,
            config.fs_info.clone(),
        );
        let bus = Arc::new(UpcallBus::new(store.clone(), handles.clone()));
        CacheInode {
            backend,
            config,
            handles,
            store,
            resolver,
            bus,
        }
    }

    /// Routes lock-grant and lock-available upcalls to `relay`. Ignored when
    /// the filesystem does not support locks.
    pub fn with_lock_relay(mut self, relay: Arc<dyn BlockingLockRelay>) -> Self {
        if !self.config.fs_info.lock_support {
            warn!("filesystem has no lock support, lock upcalls will only invalidate");
            return self;
        }
        self.bus = Arc::new(
            UpcallBus::new(self.store.clone(), self.handles.clone()).with_lock_relay(relay),
        );
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    pub fn handle_cache(&self) -> &Arc<HandleCache> {
        &self.handles
    }

    /// Resolves `name` under `parent` (or the root when both are `None`).
    /// Attributes fetched along the way are installed in the entry store.
    pub async fn lookup(
        &self,
        parent: Option<&ObjectHandle>,
        name: Option<&str>,
        want_attrs: bool,
    ) -> Result<LookupReply, CacheError> {
        let mut reply = self.resolver.lookup(parent, name, false).await?;
        if want_attrs {
            let seen = self.generation_of(&reply.handle);
            let fetched = self.resolver.fetch_attrs(&reply.handle).await;
            if let FetchedAttrs::Attrs(attrs) = &fetched {
                self.install(&reply.handle, attrs.clone(), seen);
            }
            reply.attrs = Some(fetched);
        }
        Ok(reply)
    }

    /// Attributes of `handle`, from the cache when trusted.
    pub async fn get_attributes(&self, handle: &ObjectHandle) -> Result<Attributes, CacheError> {
        if let Some(entry) = self.store.get(handle) {
            if entry.is_trusted() {
                return Ok(entry.attributes());
            }
        }
        let seen = self.generation_of(handle);
        let attrs = self.backend.get_attributes(handle).await?;
        self.install(handle, attrs.clone(), seen);
        Ok(attrs)
    }

    /// Pinned entry for `handle`, loading it from the backend on a miss.
    pub async fn get_or_create_entry(&self, handle: &ObjectHandle) -> Result<EntryRef, CacheError> {
        if let Some(entry) = self.store.get(handle) {
            return Ok(entry);
        }
        let attrs = self.backend.get_attributes(handle).await?;
        Ok(self.store.get_or_insert(handle, attrs))
    }

    pub async fn set_attributes(
        &self,
        creds: &Credentials,
        handle: &ObjectHandle,
        wanted: &AttrSet,
    ) -> Result<Attributes, CacheError> {
        let current = self.backend.get_attributes(handle).await?;
        let checked = access::check_setattr(creds, &current, wanted, &self.config.fs_info)?;
        if checked.is_empty() {
            return Ok(current);
        }
        self.backend.set_attributes(handle, &checked).await?;
        let seen = self.generation_of(handle);
        let fresh = self.backend.get_attributes(handle).await?;
        self.install(handle, fresh.clone(), seen);
        Ok(fresh)
    }

    pub async fn rename(
        &self,
        creds: &Credentials,
        src_parent: &ObjectHandle,
        src_name: &str,
        dst_parent: &ObjectHandle,
        dst_name: &str,
    ) -> Result<(), CacheError> {
        let src_dir = self.backend.get_attributes(src_parent).await?;
        let tgt_dir = if src_parent == dst_parent {
            src_dir.clone()
        } else {
            self.backend.get_attributes(dst_parent).await?
        };
        // Identities are checked here, before anything is forgotten.
        let victim = self
            .resolver
            .lookup(Some(src_parent), Some(src_name), false)
            .await?
            .handle;
        let victim_attrs = self.backend.get_attributes(&victim).await?;
        let existing = match self
            .resolver
            .lookup(Some(dst_parent), Some(dst_name), false)
            .await
        {
            Ok(reply) => Some((reply.handle, self.backend.get_attributes(&reply.handle).await?)),
            Err(CacheError::NotFound) => None,
            Err(e) => return Err(e),
        };

        access::check_rename(
            creds,
            &src_dir,
            &tgt_dir,
            &victim_attrs,
            existing.as_ref().map(|(_, a)| a),
            &self.config.fs_info,
        )?;
        self.backend
            .rename(src_parent, src_name, dst_parent, dst_name)
            .await?;

        // The moved object is about to be looked up under its new name.
        self.handles.forget(&victim);
        self.invalidate(&victim);
        if let Some((replaced, _)) = existing {
            if replaced != victim {
                self.handles.forget(&replaced);
                self.invalidate(&replaced);
            }
        }
        self.invalidate(src_parent);
        self.invalidate(dst_parent);
        debug!("renamed {src_name:?} in {src_parent} to {dst_name:?} in {dst_parent}");
        Ok(())
    }

    /// Opens `handle` on the backend and remembers the descriptor in its entry.
    pub async fn open(&self, handle: &ObjectHandle, flags: OpenFlags) -> Result<FileId, CacheError> {
        let entry = self.get_or_create_entry(handle).await?;
        let file = self.backend.open(handle, flags).await?;
        entry.with_write_lock(|state| state.open_file = Some(file));
        if flags.contains(OpenFlags::TRUNCATE) {
            entry.invalidate(InvalidateMode::ClearBits);
        }
        Ok(file)
    }

    pub async fn read(&self, file: FileId, offset: u64, len: usize) -> Result<ReadReply, CacheError> {
        Ok(self.backend.read(file, offset, len).await?)
    }

    /// Writes through to the backend. Cached size and times of `handle` are
    /// no longer trusted afterwards.
    pub async fn write(
        &self,
        handle: &ObjectHandle,
        file: FileId,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, CacheError> {
        let end = u64::try_from(data.len())
            .ok()
            .and_then(|len| offset.checked_add(len));
        match end {
            Some(end) if end <= self.config.fs_info.max_file_size => {}
            Some(end) => return Err(CacheError::FileTooLarge(end)),
            None => return Err(CacheError::FileTooLarge(u64::MAX)),
        }
        let written = self.backend.write(file, offset, data).await?;
        self.invalidate(handle);
        Ok(written)
    }

    pub async fn commit(&self, file: FileId, offset: u64, len: u64) -> Result<(), CacheError> {
        Ok(self.backend.commit(file, offset, len).await?)
    }

    pub async fn close(&self, handle: &ObjectHandle, file: FileId) -> Result<(), CacheError> {
        self.backend.close(file).await?;
        if let Some(entry) = self.store.get(handle) {
            entry.with_write_lock(|state| {
                if state.open_file == Some(file) {
                    state.open_file = None;
                }
            });
        }
        Ok(())
    }

    /// Synchronous upcall ingress.
    pub fn upcall(&self) -> Arc<UpcallBus> {
        self.bus.clone()
    }

    /// Starts `workers` tasks draining a fire-and-forget upcall queue of
    /// `upcall_queue_depth` events.
    pub fn spawn_upcall_queue(&self, workers: usize) -> (UpcallQueue, Vec<JoinHandle<()>>) {
        UpcallQueue::spawn(self.bus.clone(), workers, self.config.upcall_queue_depth)
    }

    pub fn spawn_reclaimer(&self) -> JoinHandle<()> {
        self.store
            .clone()
            .spawn_reclaimer(self.config.entries_hwmark, self.config.reclaim_interval())
    }

    /// Forgets all identities and unreferenced entries, for when the backend
    /// is unloaded.
    pub fn shutdown(&self) {
        let identities = self.handles.len();
        self.handles.clear();
        let entries = self.store.reclaim(0);
        info!("cache shut down, dropped {identities} identities and {entries} entries");
    }

    /// Generation of the cached entry for `handle`, read before a backend
    /// fetch whose result will be passed to `install`.
    fn generation_of(&self, handle: &ObjectHandle) -> Option<u64> {
        self.store.get(handle).map(|entry| entry.generation())
    }

    /// Caches `attrs` fetched after `seen` was read. A snapshot that raced
    /// with an invalidation or upcall update is dropped.
    fn install(&self, handle: &ObjectHandle, attrs: Attributes, seen: Option<u64>) {
        match (self.store.get(handle), seen) {
            (Some(entry), Some(seen)) => {
                if !entry.refresh_if_unchanged(attrs, seen) {
                    debug!("dropping attributes of {handle} fetched before an invalidation");
                }
            }
            // Created by someone else while we were fetching; theirs stays.
            (Some(_), None) => {}
            // Reclaimed while we were fetching.
            (None, Some(_)) => {}
            (None, None) => drop(self.store.get_or_insert(handle, attrs)),
        }
    }

    fn invalidate(&self, handle: &ObjectHandle) {
        if let Some(entry) = self.store.get(handle) {
            entry.invalidate(InvalidateMode::ClearBits);
        }
    }
}
