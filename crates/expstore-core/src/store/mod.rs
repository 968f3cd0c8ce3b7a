//! The expectations store: a partition-scoped, cache-coherent view of triage
//! state backed by a [`DocumentStore`].
//!
//! A store starts out uninitialized and reloads from the backend on every
//! read. After [`ExpectationsStore::initialize`] it keeps one watch per shard
//! and serves reads from memory.

mod audit;
mod cache;
mod gc;
mod loader;
mod mutation;
mod sync;

use crate::backend::{DocumentStore, SqliteDocumentStore};
use crate::config::{AccessMode, StoreConfig};
use crate::errors::{ExpStoreError, Result};
use crate::model::Expectations;
use crate::notifier::ChangeNotifier;
use crate::partition::Partition;
use crate::retry::RetryPolicy;
use cache::CacheState;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Source of "now" for mutation and GC timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Lifecycle of the per-shard sync workers.
struct SyncControl {
    // Claimed for the whole of `initialize`; `running` only once workers exist.
    starting: AtomicBool,
    running: AtomicBool,
    stopped_shards: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncControl {
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            starting: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stopped_shards: Arc::new(AtomicUsize::new(0)),
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }
}

/// Releases the `starting` claim unless `initialize` got as far as running.
struct StartClaim<'a> {
    control: &'a SyncControl,
    keep: bool,
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        if !self.keep {
            self.control.starting.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for SyncControl {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[derive(Clone)]
pub struct ExpectationsStore {
    backend: Arc<dyn DocumentStore>,
    partition: Partition,
    mode: AccessMode,
    num_shards: usize,
    change_list_shards: usize,
    retry: RetryPolicy,
    commit_retry: RetryPolicy,
    max_stream_restarts: u32,
    state: Arc<CacheState>,
    sync: Arc<SyncControl>,
    clock: Clock,
}

impl std::fmt::Debug for ExpectationsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpectationsStore")
            .field("partition", &self.partition)
            .field("mode", &self.mode)
            .field("num_shards", &self.num_shards)
            .field("syncing", &self.is_syncing())
            .finish()
    }
}

impl ExpectationsStore {
    /// Creates a store bound to the master partition.
    pub fn new(
        backend: Arc<dyn DocumentStore>,
        notifier: Option<Arc<dyn ChangeNotifier>>,
        config: &StoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        let partition = Partition::master();
        Ok(Self {
            backend,
            state: Arc::new(CacheState::new(partition.id(), notifier)),
            partition,
            mode: config.access_mode,
            num_shards: config.master_shards,
            change_list_shards: config.change_list_shards,
            retry: config.retry_policy(),
            commit_retry: config.commit_policy(),
            max_stream_restarts: config.max_stream_restarts,
            sync: Arc::new(SyncControl::new()),
            clock: Arc::new(Utc::now),
        })
    }

    /// Opens the sqlite database named by `config.db_path`.
    pub fn open(config: &StoreConfig, notifier: Option<Arc<dyn ChangeNotifier>>) -> Result<Self> {
        let backend = SqliteDocumentStore::open(&config.db_path).map_err(|e| {
            ExpStoreError::backend("open", crate::partition::MASTER_PARTITION, e)
        })?;
        tracing::debug!(db = %config.db_path.display(), "opened expectations database");
        Self::new(Arc::new(backend), notifier, config)
    }

    /// Replaces the clock. Meant for tests and backfills; call before use.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Derives a store for a change list's partition.
    ///
    /// Returns `Ok(None)` when either argument is empty; the caller should keep
    /// using the master store. The derived store shares the backend, mode and
    /// clock, uses the change-list shard count, has no notifier and starts
    /// uninitialized.
    pub fn for_change_list(&self, change_list_id: &str, review_system: &str) -> Result<Option<Self>> {
        let Some(partition) = Partition::for_change_list(change_list_id, review_system)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            backend: Arc::clone(&self.backend),
            state: Arc::new(CacheState::new(partition.id(), None)),
            partition,
            mode: self.mode,
            num_shards: self.change_list_shards,
            change_list_shards: self.change_list_shards,
            retry: self.retry,
            commit_retry: self.commit_retry,
            max_stream_restarts: self.max_stream_restarts,
            sync: Arc::new(SyncControl::new()),
            clock: Arc::clone(&self.clock),
        }))
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    pub fn is_syncing(&self) -> bool {
        self.sync.running.load(Ordering::SeqCst)
    }

    /// Number of shard workers that exited on an unrecoverable error.
    pub fn stopped_shards(&self) -> usize {
        self.sync.stopped_shards.load(Ordering::SeqCst)
    }

    /// Loads every shard and starts one live-sync worker per shard.
    ///
    /// Fails fast if any shard fails to load; no worker is started in that
    /// case. Calling it again on a syncing store, or while another call is
    /// loading, is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        if self
            .sync
            .starting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let mut claim = StartClaim {
            control: &self.sync,
            keep: false,
        };
        self.sync.shutdown.send_replace(false);

        let started = std::time::Instant::now();
        let load = self.load_with_watches().await?;
        let count = load.entries.len();
        self.state.replace(load.entries);

        let mut workers = self
            .sync
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (query, stream) in load.streams {
            let worker = sync::ShardWorker {
                query,
                stream,
                backend: Arc::clone(&self.backend),
                state: Arc::clone(&self.state),
                shutdown: self.sync.shutdown.subscribe(),
                stopped: Arc::clone(&self.sync.stopped_shards),
                partition: self.partition.id().to_string(),
                retry: self.retry,
                max_restarts: self.max_stream_restarts,
            };
            workers.push(tokio::spawn(worker.run()));
        }
        drop(workers);
        self.sync.running.store(true, Ordering::SeqCst);
        claim.keep = true;

        tracing::info!(
            event = "expstore.initialized",
            partition = %self.partition,
            shards = self.num_shards,
            entries = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "expectations store is syncing"
        );
        Ok(())
    }

    /// Stops every sync worker and waits for them to exit. Reads fall back to
    /// loading from the backend afterwards.
    pub async fn shutdown(&self) {
        let _ = self.sync.shutdown.send(true);
        let workers: Vec<_> = self
            .sync
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(partition = %self.partition, error = %e, "sync worker panicked");
            }
        }
        self.sync.running.store(false, Ordering::SeqCst);
        self.sync.starting.store(false, Ordering::SeqCst);
    }

    /// Current expectations of the partition.
    ///
    /// While syncing this is the shared snapshot; treat it as read-only.
    /// Otherwise every call reloads the partition.
    pub async fn get(&self) -> Result<Arc<Expectations>> {
        if self.is_syncing() {
            return Ok(self.state.snapshot_or_rebuild());
        }
        Ok(Arc::new(self.reload().await?))
    }

    /// Like [`get`](Self::get) but returns a copy the caller may modify.
    pub async fn get_copy(&self) -> Result<Expectations> {
        if self.is_syncing() {
            return Ok(self.state.snapshot_or_rebuild().as_ref().clone());
        }
        self.reload().await
    }

    async fn reload(&self) -> Result<Expectations> {
        let entries = self.load_entries().await?;
        self.state.replace(entries);
        Ok(self.state.project())
    }

    /// Makes sure the entry cache reflects the backend before a read-modify-write.
    async fn ensure_entry_cache(&self) -> Result<()> {
        if !self.is_syncing() {
            let entries = self.load_entries().await?;
            self.state.replace(entries);
        }
        Ok(())
    }

    fn require_writable(&self) -> Result<()> {
        if self.mode == AccessMode::ReadOnly {
            return Err(ExpStoreError::ReadOnly);
        }
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}
