use super::ExpectationsStore;
use crate::backend::{ChangeStream, CollectionPath, Document, DocumentStore, ShardQuery};
use crate::documents::{decode_entry, EntryDoc};
use crate::errors::{BackendError, ExpStoreError, Result};
use crate::retry::{with_retries, RetryPolicy};
use crate::shard;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Result of a sharded load that also opened one watch per shard.
pub(crate) struct WatchedLoad {
    pub(crate) entries: Vec<EntryDoc>,
    pub(crate) streams: Vec<(ShardQuery, Box<dyn ChangeStream>)>,
}

impl ExpectationsStore {
    pub(crate) fn shard_queries(&self) -> Vec<ShardQuery> {
        ShardQuery::for_shards(
            &CollectionPath::entries(&self.partition),
            &shard::plan(self.num_shards),
        )
    }

    /// One-shot load of every shard in parallel. The first shard error
    /// cancels the rest.
    pub(crate) async fn load_entries(&self) -> Result<Vec<EntryDoc>> {
        let partition = self.partition.id().to_string();
        let mut tasks = JoinSet::new();
        for query in self.shard_queries() {
            let backend = Arc::clone(&self.backend);
            let partition = partition.clone();
            let policy = self.retry;
            tasks.spawn(async move {
                let backend = &backend;
                let q = &query;
                let docs = with_retries("load_expectations", &partition, policy, move || {
                    backend.query(q)
                })
                .await?;
                Ok::<_, ExpStoreError>(docs)
            });
        }

        let mut entries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let docs = joined.map_err(|e| join_error(&partition, e))??;
            entries.extend(decode_entries(&partition, docs));
        }
        tracing::debug!(
            event = "expstore.load",
            partition = %partition,
            shards = self.num_shards,
            entries = entries.len(),
            "loaded entries"
        );
        Ok(entries)
    }

    /// Opens a watch on every shard and consumes each initial snapshot.
    pub(crate) async fn load_with_watches(&self) -> Result<WatchedLoad> {
        let partition = self.partition.id().to_string();
        let mut tasks = JoinSet::new();
        for query in self.shard_queries() {
            let backend = Arc::clone(&self.backend);
            let partition = partition.clone();
            let policy = self.retry;
            tasks.spawn(async move {
                let mut stream = open_watch(&backend, &query, &partition, policy).await?;
                let initial = tokio::time::timeout(policy.max_operation_time, stream.next())
                    .await
                    .map_err(|_| {
                        ExpStoreError::backend(
                            "watch_expectations",
                            &partition,
                            BackendError::Timeout("initial snapshot".into()),
                        )
                    })?
                    .map_err(|e| ExpStoreError::backend("watch_expectations", &partition, e))?;
                let docs: Vec<Document> = initial.into_iter().map(|c| c.doc).collect();
                Ok::<_, ExpStoreError>((query, stream, docs))
            });
        }

        let mut load = WatchedLoad {
            entries: Vec::new(),
            streams: Vec::new(),
        };
        while let Some(joined) = tasks.join_next().await {
            let (query, stream, docs) = joined.map_err(|e| join_error(&partition, e))??;
            load.entries.extend(decode_entries(&partition, docs));
            load.streams.push((query, stream));
        }
        load.streams.sort_by_key(|(q, _)| q.range.index);
        Ok(load)
    }
}

pub(crate) async fn open_watch(
    backend: &Arc<dyn DocumentStore>,
    query: &ShardQuery,
    partition: &str,
    policy: RetryPolicy,
) -> Result<Box<dyn ChangeStream>> {
    with_retries("watch_expectations", partition, policy, move || {
        backend.watch(query)
    })
    .await
}

/// Decodes shard documents, skipping (and logging) corrupt ones.
fn decode_entries(partition: &str, docs: Vec<Document>) -> Vec<EntryDoc> {
    docs.iter()
        .filter_map(|doc| match decode_entry(doc) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::error!(
                    event = "expstore.corrupt_entry",
                    partition = %partition,
                    error = %e,
                    "skipping corrupt entry"
                );
                None
            }
        })
        .collect()
}

fn join_error(partition: &str, e: tokio::task::JoinError) -> ExpStoreError {
    ExpStoreError::backend(
        "load_expectations",
        partition,
        BackendError::Unavailable(format!("shard task failed: {e}")),
    )
}
