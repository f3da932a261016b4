//! Resume cache access off the controller task.
//!
//! Every cache call runs on the blocking pool, one at a time and in the
//! order the controller issued it. A flush marker travels through the same
//! queue, so the controller learns when everything before it is on disk.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use blockput_resume::{ResumeCache, ResumeRecord, record_expired};
use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::controller::TaskEvent;

enum CacheOp {
    /// Reads the record for a new attempt; answered with `CacheLoaded`.
    Load { epoch: u64 },
    Store(ResumeRecord),
    Purge,
    /// Handed back to the controller once earlier operations finished.
    Flush(TaskEvent),
}

/// Handle to the task that owns all resume cache I/O of one session.
pub(crate) struct ResumeStore {
    ops: mpsc::UnboundedSender<CacheOp>,
}

impl ResumeStore {
    pub(crate) fn spawn(
        runtime: &Handle,
        session: Uuid,
        cache: Arc<dyn ResumeCache>,
        key: String,
        ttl: Duration,
        tasks: mpsc::UnboundedSender<TaskEvent>,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let worker = StoreWorker {
            session,
            cache,
            key,
            ttl,
            tasks,
        };
        runtime.spawn(worker.run(ops_rx));
        Self { ops: ops_tx }
    }

    pub(crate) fn load(&self, epoch: u64) {
        let _ = self.ops.send(CacheOp::Load { epoch });
    }

    pub(crate) fn store(&self, record: ResumeRecord) {
        let _ = self.ops.send(CacheOp::Store(record));
    }

    pub(crate) fn purge(&self) {
        let _ = self.ops.send(CacheOp::Purge);
    }

    /// Returns `event` to the controller after all queued operations.
    pub(crate) fn flush(&self, event: TaskEvent) {
        let _ = self.ops.send(CacheOp::Flush(event));
    }
}

struct StoreWorker {
    session: Uuid,
    cache: Arc<dyn ResumeCache>,
    key: String,
    ttl: Duration,
    tasks: mpsc::UnboundedSender<TaskEvent>,
}

impl StoreWorker {
    async fn run(self, mut ops: mpsc::UnboundedReceiver<CacheOp>) {
        let mut backlog = VecDeque::new();
        loop {
            let op = match backlog.pop_front() {
                Some(op) => op,
                None => match ops.recv().await {
                    Some(op) => op,
                    None => break,
                },
            };

            let reply = match op {
                CacheOp::Load { epoch } => {
                    let record = self.load().await;
                    Some(TaskEvent::CacheLoaded { epoch, record })
                }
                CacheOp::Store(mut record) => {
                    // Only the newest of back-to-back stores is written.
                    while let Ok(next) = ops.try_recv() {
                        match next {
                            CacheOp::Store(newer) => record = newer,
                            other => {
                                backlog.push_back(other);
                                break;
                            }
                        }
                    }
                    self.store(record).await;
                    None
                }
                CacheOp::Purge => {
                    self.purge().await;
                    None
                }
                CacheOp::Flush(event) => Some(event),
            };

            if let Some(event) = reply
                && self.tasks.send(event).is_err()
            {
                break;
            }
        }
        debug!(session = %self.session, "resume store stopped");
    }

    /// Reads the record, discarding it when expired.
    async fn load(&self) -> Option<ResumeRecord> {
        let cache = Arc::clone(&self.cache);
        let key = self.key.clone();
        let ttl = self.ttl;
        let session = self.session;

        let result = tokio::task::spawn_blocking(move || match cache.get(&key) {
            Ok(Some(record)) if record_expired(&record, ttl, Utc::now()) => {
                debug!(session = %session, key = %key, "discarding expired resume record");
                if let Err(e) = cache.delete(&key) {
                    warn!(session = %session, key = %key, error = %e, "failed to clear resume record");
                }
                None
            }
            Ok(Some(record)) => {
                debug!(
                    session = %session,
                    key = %key,
                    receipts = record.iter().flatten().count(),
                    "resume record loaded"
                );
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(session = %session, key = %key, error = %e, "resume cache lookup failed");
                None
            }
        })
        .await;

        result.unwrap_or_else(|e| {
            warn!(session = %self.session, error = %e, "resume cache lookup panicked");
            None
        })
    }

    async fn store(&self, record: ResumeRecord) {
        let cache = Arc::clone(&self.cache);
        let key = self.key.clone();
        let result = tokio::task::spawn_blocking(move || cache.set(&key, &record)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = %self.session, error = %e, "failed to persist resume record"),
            Err(e) => warn!(session = %self.session, error = %e, "resume cache write panicked"),
        }
    }

    async fn purge(&self) {
        let cache = Arc::clone(&self.cache);
        let key = self.key.clone();
        let result = tokio::task::spawn_blocking(move || cache.delete(&key)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = %self.session, error = %e, "failed to clear resume record"),
            Err(e) => warn!(session = %self.session, error = %e, "resume cache delete panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockput_protocol::ChunkReceipt;
    use blockput_resume::MemoryResumeCache;

    use crate::types::{Completion, UploadOutcome};

    fn store_with(
        cache: Arc<MemoryResumeCache>,
    ) -> (ResumeStore, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let store = ResumeStore::spawn(
            &Handle::current(),
            Uuid::new_v4(),
            cache,
            "8".into(),
            Duration::from_secs(6000),
            tasks_tx,
        );
        (store, tasks_rx)
    }

    fn flush_marker(epoch: u64) -> TaskEvent {
        TaskEvent::Settled {
            epoch,
            completion: Completion::Success(UploadOutcome::default()),
        }
    }

    #[tokio::test]
    async fn operations_apply_in_order_before_flush() {
        let cache = Arc::new(MemoryResumeCache::new());
        let (store, mut tasks) = store_with(cache.clone());

        store.store(vec![Some(ChunkReceipt::new("a", 4, "")), None]);
        store.store(vec![
            Some(ChunkReceipt::new("a", 4, "")),
            Some(ChunkReceipt::new("b", 4, "")),
        ]);
        store.flush(flush_marker(1));

        assert!(matches!(
            tasks.recv().await,
            Some(TaskEvent::Settled { epoch: 1, .. })
        ));
        let record = cache.get("8").unwrap().unwrap();
        assert_eq!(record[1].as_ref().unwrap().ctx, "b");

        store.purge();
        store.flush(flush_marker(2));
        assert!(matches!(
            tasks.recv().await,
            Some(TaskEvent::Settled { epoch: 2, .. })
        ));
        assert!(!cache.contains("8"));
    }

    #[tokio::test]
    async fn load_sees_earlier_stores_and_drops_expired() {
        let cache = Arc::new(MemoryResumeCache::new());
        let (store, mut tasks) = store_with(cache.clone());

        store.store(vec![Some(ChunkReceipt::new("a", 4, "x"))]);
        store.load(3);
        match tasks.recv().await {
            Some(TaskEvent::CacheLoaded { epoch: 3, record }) => {
                assert_eq!(record.unwrap()[0].as_ref().unwrap().ctx, "a");
            }
            _ => panic!("expected a loaded record"),
        }

        let mut stale = ChunkReceipt::new("old", 4, "x");
        stale.time = Utc::now() - chrono::Duration::hours(3);
        cache.set("8", &[Some(stale)]).unwrap();
        store.load(4);
        match tasks.recv().await {
            Some(TaskEvent::CacheLoaded { epoch: 4, record }) => assert!(record.is_none()),
            _ => panic!("expected an empty load"),
        }
        assert!(!cache.contains("8"));
    }
}
