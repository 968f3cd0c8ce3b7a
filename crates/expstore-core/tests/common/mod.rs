#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use expstore_core::backend::{
    BackendResult, ChangeStream, CollectionPath, DocChange, Document, DocumentStore, FieldFilter,
    ShardQuery, SqliteDocumentStore, WriteBatch,
};
use expstore_core::{BackendError, ChangeNotifier, Clock, ExpectationsStore, Id, StoreConfig};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn test_config() -> StoreConfig {
    StoreConfig {
        max_retries: 1,
        max_operation_time_secs: 5,
        ..StoreConfig::default()
    }
}

pub fn memory_backend() -> anyhow::Result<Arc<SqliteDocumentStore>> {
    Ok(Arc::new(SqliteDocumentStore::memory()?))
}

pub fn store_on(
    backend: Arc<SqliteDocumentStore>,
    config: &StoreConfig,
) -> anyhow::Result<ExpectationsStore> {
    Ok(ExpectationsStore::new(backend, None, config)?)
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Clock that starts at `t0()` and moves one second per reading.
pub fn ticking_clock() -> Clock {
    let secs = Arc::new(AtomicI64::new(0));
    Arc::new(move || t0() + Duration::seconds(secs.fetch_add(1, Ordering::SeqCst)))
}

#[derive(Default)]
pub struct Collector {
    seen: Mutex<Vec<Id>>,
}

impl Collector {
    pub fn ids(&self) -> Vec<Id> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl ChangeNotifier for Collector {
    fn notify_change(&self, id: &Id) {
        self.seen.lock().unwrap().push(id.clone());
    }
}

/// Polls `check` until it holds or five seconds pass.
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}

/// How a shard's watch stream fails on its next batch.
#[derive(Debug, Clone, Copy)]
pub enum StreamFault {
    /// The subscriber fell behind; the worker may restart the watch.
    Lagged,
    /// The feed went away for good.
    Closed,
}

impl StreamFault {
    fn error(self) -> BackendError {
        match self {
            StreamFault::Lagged => BackendError::StreamLagged(1),
            StreamFault::Closed => BackendError::StreamClosed,
        }
    }
}

type StreamFaults = Arc<Mutex<HashMap<usize, VecDeque<StreamFault>>>>;

/// Delegates to sqlite and injects failures on demand.
pub struct FaultyStore {
    inner: Arc<SqliteDocumentStore>,
    commits: AtomicUsize,
    fail_from: usize,
    fail_until: usize,
    broken_shard: Mutex<Option<usize>>,
    stream_faults: StreamFaults,
    watch_opens: AtomicUsize,
    before_next_commit: Mutex<Option<WriteBatch>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<SqliteDocumentStore>) -> Self {
        Self::failing_commits(inner, 0, 0)
    }

    /// Commits numbered `fail_from..fail_until` (zero based) fail.
    pub fn failing_commits(inner: Arc<SqliteDocumentStore>, fail_from: usize, fail_until: usize) -> Self {
        Self {
            inner,
            commits: AtomicUsize::new(0),
            fail_from,
            fail_until,
            broken_shard: Mutex::new(None),
            stream_faults: Arc::default(),
            watch_opens: AtomicUsize::new(0),
            before_next_commit: Mutex::new(None),
        }
    }

    /// Queries and watches on shard `index` fail permanently until cleared.
    pub fn break_shard(&self, index: Option<usize>) {
        *self.broken_shard.lock().unwrap() = index;
    }

    /// Queues a failure for the next batch delivered on shard `index`.
    pub fn fail_stream(&self, index: usize, fault: StreamFault) {
        self.stream_faults
            .lock()
            .unwrap()
            .entry(index)
            .or_default()
            .push_back(fault);
    }

    pub fn watch_opens(&self) -> usize {
        self.watch_opens.load(Ordering::SeqCst)
    }

    /// Lands `batch` just before the next commit, as a concurrent writer would.
    pub fn interleave(&self, batch: WriteBatch) {
        *self.before_next_commit.lock().unwrap() = Some(batch);
    }

    fn check_shard(&self, query: &ShardQuery) -> BackendResult<()> {
        if *self.broken_shard.lock().unwrap() == Some(query.range.index) {
            return Err(BackendError::InvalidQuery(format!(
                "shard {} is unreadable",
                query.range.index
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    async fn query(&self, query: &ShardQuery) -> BackendResult<Vec<Document>> {
        self.check_shard(query)?;
        self.inner.query(query).await
    }

    async fn watch(&self, query: &ShardQuery) -> BackendResult<Box<dyn ChangeStream>> {
        self.check_shard(query)?;
        self.watch_opens.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.watch(query).await?;
        Ok(Box::new(FaultyStream {
            inner,
            shard: query.range.index,
            faults: Arc::clone(&self.stream_faults),
        }))
    }

    async fn find(
        &self,
        collection: &CollectionPath,
        filter: Option<&FieldFilter>,
    ) -> BackendResult<Vec<Document>> {
        self.inner.find(collection, filter).await
    }

    async fn get(&self, collection: &CollectionPath, id: &str) -> BackendResult<Option<Document>> {
        self.inner.get(collection, id).await
    }

    async fn commit(&self, batch: &WriteBatch) -> BackendResult<usize> {
        let interleaved = self.before_next_commit.lock().unwrap().take();
        if let Some(other) = interleaved {
            self.inner.commit(&other).await?;
        }
        let n = self.commits.fetch_add(1, Ordering::SeqCst);
        if n >= self.fail_from && n < self.fail_until {
            return Err(BackendError::Unavailable(format!("injected failure on commit {n}")));
        }
        self.inner.commit(batch).await
    }

    fn new_doc_id(&self) -> String {
        self.inner.new_doc_id()
    }
}

struct FaultyStream {
    inner: Box<dyn ChangeStream>,
    shard: usize,
    faults: StreamFaults,
}

#[async_trait]
impl ChangeStream for FaultyStream {
    async fn next(&mut self) -> BackendResult<Vec<DocChange>> {
        let batch = self.inner.next().await?;
        let fault = self
            .faults
            .lock()
            .unwrap()
            .get_mut(&self.shard)
            .and_then(VecDeque::pop_front);
        match fault {
            Some(fault) => Err(fault.error()),
            None => Ok(batch),
        }
    }
}
