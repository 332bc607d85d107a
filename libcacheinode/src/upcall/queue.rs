use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;

use crate::error::UpcallError;

use super::{UpcallBus, UpcallEvent};

/// Fire-and-forget submission of upcalls from driver threads.
///
/// Events are drained by a pool of worker tasks. Failures are logged, never
/// reported back to the submitter. The queue is bounded: once `capacity`
/// events are pending, further submissions are dropped and counted.
#[derive(Clone)]
pub struct UpcallQueue {
    tx: Sender<UpcallEvent>,
    dropped: Arc<AtomicU64>,
}

impl UpcallQueue {
    /// Starts `workers` tasks applying events to `bus`. The workers exit once
    /// every clone of the returned queue is dropped.
    pub fn spawn(
        bus: Arc<UpcallBus>,
        workers: usize,
        capacity: usize,
    ) -> (UpcallQueue, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let tasks = (0..workers.max(1))
            .map(|id| tokio::spawn(run_worker(id, bus.clone(), rx.clone())))
            .collect();
        let queue = UpcallQueue {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (queue, tasks)
    }

    /// Never blocks. Returns false if the event was dropped.
    pub fn submit(&self, event: UpcallEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("upcall queue full, dropping event for {}", event.target);
                false
            }
            Err(TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("upcall queue closed, dropping event for {}", event.target);
                false
            }
        }
    }

    /// Events dropped so far because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run_worker(id: usize, bus: Arc<UpcallBus>, rx: Arc<Mutex<Receiver<UpcallEvent>>>) {
    loop {
        let event = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(event) = event else {
            break;
        };
        let target = event.target;
        match bus.apply(event) {
            Ok(()) => {}
            Err(UpcallError::NotFound) => debug!("upcall worker {id}: {target} not cached"),
            Err(e) => warn!("upcall worker {id}: {target}: {e}"),
        }
    }
    info!("upcall worker {id} stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::handle::ObjectHandle;
    use crate::handle_cache::HandleCache;
    use crate::models::{AttrSet, Attributes, ObjectType};
    use crate::store::EntryStore;
    use crate::upcall::UpdateFlags;

    #[tokio::test]
    async fn test_submitted_events_are_applied() {
        let store = Arc::new(EntryStore::new());
        let bus = Arc::new(UpcallBus::new(store.clone(), Arc::new(HandleCache::new())));
        let h = ObjectHandle::padded(b"queued");
        let entry = store.get_or_insert(&h, Attributes::new(ObjectType::RegularFile, 1));

        let (queue, workers) = UpcallQueue::spawn(bus, 2, 16);
        let up = AttrSet {
            size: Some(512),
            ..Default::default()
        };
        assert!(queue.submit(UpcallEvent::update(h, up, UpdateFlags::empty())));
        assert!(queue.submit(UpcallEvent::invalidate(ObjectHandle::padded(b"other"))));
        assert_eq!(queue.dropped(), 0);
        drop(queue);

        for w in workers {
            tokio::time::timeout(Duration::from_secs(2), w)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(entry.attributes().size, 512);
        assert!(!entry.is_trusted());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let store = Arc::new(EntryStore::new());
        let bus = Arc::new(UpcallBus::new(store.clone(), Arc::new(HandleCache::new())));
        let h = ObjectHandle::padded(b"busy");
        let entry = store.get_or_insert(&h, Attributes::new(ObjectType::RegularFile, 1));

        // Workers cannot run until this single-threaded test yields.
        let (queue, workers) = UpcallQueue::spawn(bus, 1, 2);
        let accepted = (0..10)
            .filter(|_| queue.submit(UpcallEvent::invalidate(h)))
            .count();
        assert_eq!(accepted, 2);
        assert_eq!(queue.dropped(), 8);
        drop(queue);

        for w in workers {
            tokio::time::timeout(Duration::from_secs(2), w)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(!entry.is_trusted());
    }
}
