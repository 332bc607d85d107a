use async_trait::async_trait;
use libcacheinode::backend::{Backend, FileId, InMemoryBackend, OpenFlags, ReadReply};
use libcacheinode::entry::{EntryFlags, InvalidateMode};
use libcacheinode::handle::HANDLE_LEN;
use libcacheinode::locks::{LockNotificationKind, LockParam, LockType, PendingLockNotifications};
use libcacheinode::models::{AttrSet, Attributes, FetchedAttrs, FsTime, ObjectType};
use libcacheinode::upcall::{UpcallEvent, UpcallKind, UpdateFlags};
use libcacheinode::{
    BackendError, CacheConfig, CacheInode, CorruptionPolicy, ObjectHandle, UpcallError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn make_cache() -> (CacheInode, Arc<InMemoryBackend>) {
    init_logger();
    let backend = Arc::new(InMemoryBackend::new());
    let config = CacheConfig {
        corruption_policy: CorruptionPolicy::Reject,
        ..Default::default()
    };
    (CacheInode::new(backend.clone(), config), backend)
}

/// Creates a file of `size` bytes with the given mtime and caches it.
async fn cached_file(
    cache: &CacheInode,
    backend: &InMemoryBackend,
    name: &str,
    size: u64,
    mtime: FsTime,
) -> ObjectHandle {
    let h = backend.create_file(&backend.root(), name).unwrap();
    backend.modify(&h, |a| {
        a.size = size;
        a.mtime = mtime;
    });
    cache.get_or_create_entry(&h).await.unwrap();
    h
}

fn size_update(h: ObjectHandle, size: u64, flags: UpdateFlags) -> UpcallEvent {
    let attrs = AttrSet {
        size: Some(size),
        ..Default::default()
    };
    UpcallEvent::update(h, attrs, flags)
}

fn mtime_update(h: ObjectHandle, mtime: FsTime) -> UpcallEvent {
    let attrs = AttrSet {
        mtime: Some(mtime),
        ..Default::default()
    };
    UpcallEvent::update(h, attrs, UpdateFlags::MTIME_INC)
}

#[tokio::test]
async fn test_size_increase_only_flag() {
    let (cache, backend) = make_cache();
    let h = cached_file(&cache, &backend, "f", 100, FsTime::default()).await;
    let bus = cache.upcall();

    bus.apply(size_update(h, 50, UpdateFlags::SIZE_INC)).unwrap();
    assert_eq!(cache.store().get(&h).unwrap().attributes().size, 100);

    bus.apply(size_update(h, 50, UpdateFlags::empty())).unwrap();
    assert_eq!(cache.store().get(&h).unwrap().attributes().size, 50);
}

#[tokio::test]
async fn test_mtime_increase_only_flag() {
    let (cache, backend) = make_cache();
    let h = cached_file(&cache, &backend, "f", 0, FsTime::new(100, 0)).await;
    let bus = cache.upcall();

    bus.apply(mtime_update(h, FsTime::new(100, 500))).unwrap();
    assert_eq!(
        cache.store().get(&h).unwrap().attributes().mtime,
        FsTime::new(100, 500)
    );

    bus.apply(mtime_update(h, FsTime::new(99, 999_999_999))).unwrap();
    assert_eq!(
        cache.store().get(&h).unwrap().attributes().mtime,
        FsTime::new(100, 500)
    );
}

#[tokio::test]
async fn test_update_clears_trust_even_without_change() {
    let (cache, backend) = make_cache();
    let root = backend.root();
    let dir = cache.get_or_create_entry(&root).await.unwrap();
    dir.set_flags(EntryFlags::DIR_POPULATED);
    let size = dir.attributes().size;

    cache
        .upcall()
        .apply(size_update(root, size, UpdateFlags::empty()))
        .unwrap();
    assert!(dir.flags().is_empty());

    // The next read goes back to the backend and trusts the result again.
    let calls = backend.getattr_calls();
    cache.get_attributes(&root).await.unwrap();
    assert_eq!(backend.getattr_calls(), calls + 1);
    assert!(dir.is_trusted());
}

#[tokio::test]
async fn test_update_of_type_is_rejected() {
    let (cache, backend) = make_cache();
    let h = cached_file(&cache, &backend, "f", 7, FsTime::default()).await;
    let attrs = AttrSet {
        object_type: Some(ObjectType::Directory),
        size: Some(9),
        ..Default::default()
    };
    let err = cache
        .upcall()
        .apply(UpcallEvent::update(h, attrs, UpdateFlags::empty()))
        .unwrap_err();
    assert!(matches!(err, UpcallError::InvalidArgument(_)));

    let entry = cache.store().get(&h).unwrap();
    assert!(entry.is_trusted());
    assert_eq!(entry.attributes().size, 7);
    assert_eq!(entry.attributes().object_type, ObjectType::RegularFile);
}

#[tokio::test]
async fn test_update_for_uncached_object() {
    let (cache, _) = make_cache();
    let h = ObjectHandle::from_bytes([0xee; HANDLE_LEN]);
    let err = cache
        .upcall()
        .apply(size_update(h, 1, UpdateFlags::empty()))
        .unwrap_err();
    assert_eq!(err, UpcallError::NotFound);
    assert!(cache.store().is_empty());
}

#[tokio::test]
async fn test_other_events_invalidate() {
    let (cache, backend) = make_cache();
    let h = cached_file(&cache, &backend, "f", 0, FsTime::default()).await;
    let bus = cache.upcall();
    for kind in [
        UpcallKind::Create,
        UpcallKind::Commit,
        UpcallKind::Write,
        UpcallKind::Link,
        UpcallKind::Open,
        UpcallKind::Close,
        UpcallKind::SetAttr,
    ] {
        cache.get_attributes(&h).await.unwrap();
        assert!(cache.store().get(&h).unwrap().is_trusted());
        bus.apply(UpcallEvent::new(h, kind)).unwrap();
        assert!(!cache.store().get(&h).unwrap().is_trusted());
    }
}

#[tokio::test]
async fn test_unlink_forgets_identity() {
    let (cache, backend) = make_cache();
    let root = backend.root();
    let f = backend.create_file(&root, "f").unwrap();
    cache.lookup(Some(&root), Some("f"), true).await.unwrap();
    assert!(cache.handle_cache().get(&f).is_some());

    cache
        .upcall()
        .apply(UpcallEvent::new(f, UpcallKind::Unlink))
        .unwrap();
    assert!(cache.handle_cache().get(&f).is_none());
    assert!(!cache.store().get(&f).unwrap().is_trusted());
}

#[tokio::test]
async fn test_invalidate_close_drops_open_file() {
    let (cache, backend) = make_cache();
    let h = cached_file(&cache, &backend, "f", 0, FsTime::default()).await;
    let fd = cache.open(&h, OpenFlags::READ).await.unwrap();
    let entry = cache.store().get(&h).unwrap();
    assert_eq!(entry.with_read_lock(|s| s.open_file), Some(fd));

    let bus = cache.upcall();
    bus.apply(UpcallEvent::invalidate(h)).unwrap();
    assert_eq!(entry.with_read_lock(|s| s.open_file), Some(fd));

    bus.apply(UpcallEvent::new(
        h,
        UpcallKind::Invalidate {
            mode: InvalidateMode::Close,
        },
    ))
    .unwrap();
    assert_eq!(entry.with_read_lock(|s| s.open_file), None);
    cache.close(&h, fd).await.unwrap();
}

#[tokio::test]
async fn test_lock_notifications_are_relayed() {
    init_logger();
    let backend = Arc::new(InMemoryBackend::new());
    let relay = Arc::new(PendingLockNotifications::new());
    let cache = CacheInode::new(backend.clone(), CacheConfig::default())
        .with_lock_relay(relay.clone());
    let h = cached_file(&cache, &backend, "locked", 0, FsTime::default()).await;
    let lock = LockParam {
        lock_type: LockType::Write,
        start: 0,
        length: 10,
    };
    let bus = cache.upcall();

    bus.apply(UpcallEvent::new(h, UpcallKind::LockGrant { owner: 7, lock }))
        .unwrap();
    bus.apply(UpcallEvent::new(h, UpcallKind::LockAvail { owner: 8, lock }))
        .unwrap();
    let elsewhere = ObjectHandle::from_bytes([0xee; HANDLE_LEN]);
    bus.apply(UpcallEvent::new(
        elsewhere,
        UpcallKind::LockGrant { owner: 9, lock },
    ))
    .unwrap();

    let seen = relay.drain();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].kind, LockNotificationKind::Granted);
    assert_eq!((seen[0].handle, seen[0].owner), (h, 7));
    assert_eq!(seen[1].kind, LockNotificationKind::Available);
    assert_eq!(seen[1].lock, lock);
    assert_eq!(cache.store().get(&h).unwrap().refcount(), 1);
}

#[tokio::test]
async fn test_lock_upcall_without_relay_invalidates() {
    let (cache, backend) = make_cache();
    let h = cached_file(&cache, &backend, "f", 0, FsTime::default()).await;
    let lock = LockParam {
        lock_type: LockType::Read,
        start: 0,
        length: 0,
    };
    cache
        .upcall()
        .apply(UpcallEvent::new(h, UpcallKind::LockAvail { owner: 1, lock }))
        .unwrap();
    assert!(!cache.store().get(&h).unwrap().is_trusted());
}

#[tokio::test]
async fn test_concurrent_updates_on_distinct_entries() {
    let (cache, backend) = make_cache();
    let a = cached_file(&cache, &backend, "a", 0, FsTime::default()).await;
    let b = cached_file(&cache, &backend, "b", 0, FsTime::default()).await;
    let bus = cache.upcall();

    std::thread::scope(|s| {
        for h in [a, b] {
            let bus = bus.clone();
            s.spawn(move || {
                for size in 1..=1000 {
                    bus.apply(size_update(h, size, UpdateFlags::SIZE_INC))
                        .unwrap();
                }
            });
        }
    });
    assert_eq!(cache.store().get(&a).unwrap().attributes().size, 1000);
    assert_eq!(cache.store().get(&b).unwrap().attributes().size, 1000);
}

#[tokio::test]
async fn test_concurrent_updates_on_one_entry_are_atomic() {
    let (cache, backend) = make_cache();
    let h = cached_file(&cache, &backend, "f", 0, FsTime::default()).await;
    let bus = cache.upcall();

    let full = |tag: u32| AttrSet {
        size: Some(u64::from(tag)),
        mode: Some(tag),
        owner: Some(tag),
        group: Some(tag),
        mtime: Some(FsTime::new(u64::from(tag), tag)),
        ..Default::default()
    };

    std::thread::scope(|s| {
        for tag in [1u32, 2u32] {
            let bus = bus.clone();
            let attrs = full(tag);
            s.spawn(move || {
                for _ in 0..500 {
                    bus.apply(UpcallEvent::update(h, attrs.clone(), UpdateFlags::empty()))
                        .unwrap();
                }
            });
        }
    });

    let a = cache.store().get(&h).unwrap().attributes();
    let tag = a.mode;
    assert!(tag == 1 || tag == 2);
    assert_eq!(a.size, u64::from(tag));
    assert_eq!(a.owner, tag);
    assert_eq!(a.group, tag);
    assert_eq!(a.mtime, FsTime::new(u64::from(tag), tag));
}

#[tokio::test]
async fn test_queue_applies_events_in_background() {
    let (cache, backend) = make_cache();
    let h = cached_file(&cache, &backend, "f", 10, FsTime::default()).await;
    let (queue, workers) = cache.spawn_upcall_queue(2);

    queue.submit(size_update(h, 20, UpdateFlags::SIZE_INC));
    queue.submit(size_update(
        ObjectHandle::from_bytes([0xee; HANDLE_LEN]),
        1,
        UpdateFlags::empty(),
    ));
    queue.submit(UpcallEvent::update(
        h,
        AttrSet::default(),
        UpdateFlags::from_bits_retain(0x8000),
    ));
    drop(queue);

    for w in workers {
        timeout(Duration::from_secs(2), w).await.unwrap().unwrap();
    }
    assert_eq!(cache.store().get(&h).unwrap().attributes().size, 20);
}

#[tokio::test]
async fn test_reclaimer_keeps_pinned_entries() {
    init_logger();
    let backend = Arc::new(InMemoryBackend::new());
    let config = CacheConfig {
        entries_hwmark: 1,
        reclaim_interval_ms: 10,
        ..Default::default()
    };
    let cache = CacheInode::new(backend.clone(), config);
    let root = backend.root();
    let pinned = cache.get_or_create_entry(&root).await.unwrap();
    for n in 0..5 {
        let f = backend.create_file(&root, &format!("f{n}")).unwrap();
        cache.get_attributes(&f).await.unwrap();
    }
    assert_eq!(cache.store().len(), 6);

    let task = cache.spawn_reclaimer();
    timeout(Duration::from_secs(2), async {
        while cache.store().len() > 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    task.abort();
    assert!(cache.store().contains(pinned.handle()));

    drop(pinned);
    cache.shutdown();
    assert!(cache.store().is_empty());
    assert!(cache.handle_cache().is_empty());
}

/// Holds the next attribute fetch of one handle until released, after the
/// backend has produced its answer.
struct PausingBackend {
    inner: Arc<InMemoryBackend>,
    hold: Mutex<Option<ObjectHandle>>,
    fetched: Notify,
    release: Notify,
}

impl PausingBackend {
    fn new(inner: Arc<InMemoryBackend>) -> Self {
        PausingBackend {
            inner,
            hold: Mutex::new(None),
            fetched: Notify::new(),
            release: Notify::new(),
        }
    }

    fn hold_next_fetch(&self, handle: ObjectHandle) {
        *self.hold.lock().unwrap() = Some(handle);
    }
}

#[async_trait]
impl Backend for PausingBackend {
    async fn lookup_root(&self) -> Result<ObjectHandle, BackendError> {
        self.inner.lookup_root().await
    }

    async fn lookup(
        &self,
        parent: &ObjectHandle,
        name: &str,
    ) -> Result<ObjectHandle, BackendError> {
        self.inner.lookup(parent, name).await
    }

    async fn get_attributes(&self, handle: &ObjectHandle) -> Result<Attributes, BackendError> {
        let attrs = self.inner.get_attributes(handle).await;
        let held = {
            let mut hold = self.hold.lock().unwrap();
            if hold.as_ref() == Some(handle) {
                hold.take()
            } else {
                None
            }
        };
        if held.is_some() {
            self.fetched.notify_one();
            self.release.notified().await;
        }
        attrs
    }

    async fn set_attributes(
        &self,
        handle: &ObjectHandle,
        attrs: &AttrSet,
    ) -> Result<(), BackendError> {
        self.inner.set_attributes(handle, attrs).await
    }

    async fn open(&self, handle: &ObjectHandle, flags: OpenFlags) -> Result<FileId, BackendError> {
        self.inner.open(handle, flags).await
    }

    async fn read(&self, file: FileId, offset: u64, len: usize) -> Result<ReadReply, BackendError> {
        self.inner.read(file, offset, len).await
    }

    async fn write(&self, file: FileId, offset: u64, data: &[u8]) -> Result<usize, BackendError> {
        self.inner.write(file, offset, data).await
    }

    async fn commit(&self, file: FileId, offset: u64, len: u64) -> Result<(), BackendError> {
        self.inner.commit(file, offset, len).await
    }

    async fn close(&self, file: FileId) -> Result<(), BackendError> {
        self.inner.close(file).await
    }

    async fn rename(
        &self,
        src_parent: &ObjectHandle,
        src_name: &str,
        dst_parent: &ObjectHandle,
        dst_name: &str,
    ) -> Result<(), BackendError> {
        self.inner
            .rename(src_parent, src_name, dst_parent, dst_name)
            .await
    }
}

fn make_paused_cache() -> (Arc<CacheInode>, Arc<PausingBackend>, Arc<InMemoryBackend>) {
    init_logger();
    let inner = Arc::new(InMemoryBackend::new());
    let backend = Arc::new(PausingBackend::new(inner.clone()));
    let config = CacheConfig {
        corruption_policy: CorruptionPolicy::Reject,
        ..Default::default()
    };
    (Arc::new(CacheInode::new(backend.clone(), config)), backend, inner)
}

#[tokio::test]
async fn test_update_during_refetch_is_not_overwritten() {
    let (cache, backend, inner) = make_paused_cache();
    let h = inner.create_file(&inner.root(), "f").unwrap();
    inner.modify(&h, |a| a.size = 100);
    cache.get_or_create_entry(&h).await.unwrap();
    cache.upcall().apply(UpcallEvent::invalidate(h)).unwrap();

    backend.hold_next_fetch(h);
    let reader = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_attributes(&h).await })
    };
    timeout(Duration::from_secs(2), backend.fetched.notified())
        .await
        .unwrap();

    // Arrives after the backend answered, before the answer is cached.
    cache
        .upcall()
        .apply(size_update(h, 50, UpdateFlags::empty()))
        .unwrap();
    backend.release.notify_one();
    let fetched = timeout(Duration::from_secs(2), reader)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(fetched.size, 100);

    let entry = cache.store().get(&h).unwrap();
    assert_eq!(entry.attributes().size, 50);
    assert!(!entry.is_trusted());

    // A fetch that starts after the update is trusted again.
    inner.modify(&h, |a| a.size = 50);
    assert_eq!(cache.get_attributes(&h).await.unwrap().size, 50);
    assert!(entry.is_trusted());
}

#[tokio::test]
async fn test_invalidation_during_lookup_fetch_is_kept() {
    let (cache, backend, inner) = make_paused_cache();
    let root = inner.root();
    let h = inner.create_file(&root, "f").unwrap();
    cache.get_or_create_entry(&h).await.unwrap();

    backend.hold_next_fetch(h);
    let looker = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.lookup(Some(&root), Some("f"), true).await })
    };
    timeout(Duration::from_secs(2), backend.fetched.notified())
        .await
        .unwrap();
    cache.upcall().apply(UpcallEvent::invalidate(h)).unwrap();
    backend.release.notify_one();

    let reply = timeout(Duration::from_secs(2), looker)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(reply.attrs, Some(FetchedAttrs::Attrs(_))));
    assert!(!cache.store().get(&h).unwrap().is_trusted());
}

#[tokio::test]
async fn test_lock_upcalls_invalidate_without_lock_support() {
    init_logger();
    let backend = Arc::new(InMemoryBackend::new());
    let mut config = CacheConfig::default();
    config.fs_info.lock_support = false;
    let relay = Arc::new(PendingLockNotifications::new());
    let cache = CacheInode::new(backend.clone(), config).with_lock_relay(relay.clone());
    let h = cached_file(&cache, &backend, "f", 0, FsTime::default()).await;
    let lock = LockParam {
        lock_type: LockType::Write,
        start: 0,
        length: 1,
    };

    cache
        .upcall()
        .apply(UpcallEvent::new(h, UpcallKind::LockGrant { owner: 3, lock }))
        .unwrap();
    assert!(relay.drain().is_empty());
    assert!(!cache.store().get(&h).unwrap().is_trusted());
}

#[tokio::test]
async fn test_queue_depth_from_config() {
    init_logger();
    let backend = Arc::new(InMemoryBackend::new());
    let config = CacheConfig {
        upcall_queue_depth: 1,
        ..Default::default()
    };
    let cache = CacheInode::new(backend.clone(), config);
    let h = cached_file(&cache, &backend, "f", 0, FsTime::default()).await;
    let (queue, workers) = cache.spawn_upcall_queue(1);

    assert!(queue.submit(UpcallEvent::invalidate(h)));
    assert!(!queue.submit(UpcallEvent::invalidate(h)));
    assert_eq!(queue.dropped(), 1);
    drop(queue);
    for w in workers {
        timeout(Duration::from_secs(2), w).await.unwrap().unwrap();
    }
    assert!(!cache.store().get(&h).unwrap().is_trusted());
}
