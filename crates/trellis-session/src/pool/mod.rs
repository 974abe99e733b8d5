//! Sharded background worker pools.
//!
//! Each pool owns N bounded channels with one task per channel. Jobs are
//! routed by the murmur3 hash of the session key so every job of one
//! session lands on the same worker and runs in submission order.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use trellis_core::hash::slot_index;

pub mod persist;
pub mod summary;

pub use persist::{EventPersister, PersistJob, PersistPool};
pub use summary::{SummaryJob, SummaryPool};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Channels and worker tasks of one pool.
pub struct WorkerShards<T> {
    name: &'static str,
    senders: Mutex<Option<Vec<mpsc::Sender<T>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerShards<T> {
    /// Create `workers` channels of `buffer` slots; returns their receivers.
    pub fn new(name: &'static str, workers: usize, buffer: usize) -> (Arc<Self>, Vec<mpsc::Receiver<T>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..workers.max(1)).map(|_| mpsc::channel(buffer.max(1))).unzip();
        let shards = Arc::new(Self { name, senders: Mutex::new(Some(senders)), handles: Mutex::new(Vec::new()) });
        (shards, receivers)
    }

    /// Spawn one task per receiver, each handling its jobs in order.
    pub fn spawn_workers<F, Fut>(&self, receivers: Vec<mpsc::Receiver<T>>, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut handles = lock(&self.handles);
        for (index, mut rx) in receivers.into_iter().enumerate() {
            let handler = Arc::clone(&handler);
            let name = self.name;
            handles.push(tokio::spawn(async move {
                debug!(pool = name, worker = index, "worker started");
                while let Some(job) = rx.recv().await {
                    handler(job).await;
                }
                debug!(pool = name, worker = index, "worker stopped");
            }));
        }
    }

    /// Sender of the shard owning `hash_key`; `None` once closed.
    pub fn sender_for(&self, hash_key: &str) -> Option<mpsc::Sender<T>> {
        let senders = lock(&self.senders);
        let senders = senders.as_ref()?;
        senders.get(slot_index(hash_key, senders.len())).cloned()
    }

    /// Number of shards
    pub fn len(&self) -> usize {
        lock(&self.senders).as_ref().map_or(0, Vec::len)
    }

    /// True once closed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the senders once and wait for the workers to drain.
    pub async fn close(&self) {
        let senders = lock(&self.senders).take();
        if senders.is_none() {
            return;
        }
        drop(senders);
        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(pool = self.name, error = %e, "worker task failed");
            }
        }
        debug!(pool = self.name, "pool closed");
    }
}
