use super::cache::CacheState;
use super::loader::open_watch;
use crate::backend::{BackendResult, ChangeStream, DocChange, DocumentStore, ShardQuery};
use crate::retry::RetryPolicy;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

enum Step {
    Shutdown { store_gone: bool },
    Batch(BackendResult<Vec<DocChange>>),
}

/// Applies one shard's watch stream to the shared entry cache until shutdown.
pub(crate) struct ShardWorker {
    pub(crate) query: ShardQuery,
    pub(crate) stream: Box<dyn ChangeStream>,
    pub(crate) backend: Arc<dyn DocumentStore>,
    pub(crate) state: Arc<CacheState>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) stopped: Arc<AtomicUsize>,
    pub(crate) partition: String,
    pub(crate) retry: RetryPolicy,
    pub(crate) max_restarts: u32,
}

impl ShardWorker {
    pub(crate) async fn run(mut self) {
        let shard = self.query.range.index;
        let mut restarts = 0u32;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let step = tokio::select! {
                changed = self.shutdown.changed() => Step::Shutdown { store_gone: changed.is_err() },
                next = self.stream.next() => Step::Batch(next),
            };
            let next = match step {
                // A dropped sender means the store itself is gone.
                Step::Shutdown { store_gone: true } => break,
                Step::Shutdown { .. } => continue,
                Step::Batch(next) => next,
            };

            match next {
                Ok(changes) => {
                    let count = changes.len();
                    let notified = self.state.apply_changes(changes);
                    tracing::trace!(
                        partition = %self.partition,
                        shard,
                        changes = count,
                        notified = notified.len(),
                        "applied watch batch"
                    );
                }
                Err(e) if e.is_transient() && restarts < self.max_restarts => {
                    restarts += 1;
                    tracing::warn!(
                        event = "expstore.shard.restart",
                        partition = %self.partition,
                        shard,
                        attempt = restarts,
                        error = %e,
                        "restarting shard watch"
                    );
                    // The new stream opens with a full snapshot, which reconciles
                    // whatever this shard missed.
                    match open_watch(&self.backend, &self.query, &self.partition, self.retry).await
                    {
                        Ok(stream) => self.stream = stream,
                        Err(e) => {
                            self.stop(&e.to_string());
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.stop(&e.to_string());
                    return;
                }
            }
        }
        tracing::debug!(partition = %self.partition, shard, "shard sync cancelled");
    }

    fn stop(&self, reason: &str) {
        let stopped = self.stopped.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::error!(
            event = "expstore.shard.stopped",
            partition = %self.partition,
            shard = self.query.range.index,
            stopped_shards = stopped,
            error = %reason,
            "shard sync stopped; this shard's cache is no longer refreshed"
        );
    }
}
