use super::{
    schema, BackendResult, ChangeKind, ChangeStream, CollectionPath, DocChange, Document,
    DocumentStore, FieldFilter, ShardQuery, WriteBatch, WriteOp, MAX_BATCH_DOCS,
};
use crate::errors::BackendError;
use crate::shard::{digest_hash, ShardRange, SHARD_FIELD};
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

// Batches buffered per watch subscriber before it is reported as lagging.
const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct FeedItem {
    path: String,
    shard_hash: u32,
    change: DocChange,
}

type Feed = Arc<Vec<FeedItem>>;

/// Document store on a single sqlite database.
///
/// Watches are served from an in-process change feed that every committed
/// batch is published to, in commit order.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    conn: Arc<Mutex<Connection>>,
    feed: broadcast::Sender<Feed>,
}

impl SqliteDocumentStore {
    pub fn open(path: &Path) -> BackendResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::with_connection(conn)
    }

    pub fn memory() -> BackendResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> BackendResult<Self> {
        conn.execute_batch(schema::DDL)?;
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            feed,
        })
    }

    /// Runs `f` against the connection on the blocking pool so callers can
    /// time out and other tasks keep running. A timed-out call still runs
    /// to completion.
    async fn with_conn<T, F>(&self, f: F) -> BackendResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> BackendResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut *guard)
        })
        .await
        .map_err(|e| BackendError::Unavailable(format!("sqlite task failed: {e}")))?
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn query(&self, query: &ShardQuery) -> BackendResult<Vec<Document>> {
        let query = query.clone();
        self.with_conn(move |conn| query_shard(conn, &query.collection, &query.range))
            .await
    }

    async fn watch(&self, query: &ShardQuery) -> BackendResult<Box<dyn ChangeStream>> {
        let feed = self.feed.clone();
        let q = query.clone();
        // Subscribe and snapshot under the same lock so no commit slips between them.
        let (rx, docs) = self
            .with_conn(move |conn| {
                let rx = feed.subscribe();
                let docs = query_shard(conn, &q.collection, &q.range)?;
                Ok((rx, docs))
            })
            .await?;
        let initial = docs
            .into_iter()
            .map(|doc| DocChange {
                kind: ChangeKind::Added,
                doc,
            })
            .collect();
        Ok(Box::new(SqliteChangeStream {
            rx,
            path: query.collection.path(),
            range: query.range,
            initial: Some(initial),
        }))
    }

    async fn find(
        &self,
        collection: &CollectionPath,
        filter: Option<&FieldFilter>,
    ) -> BackendResult<Vec<Document>> {
        let path = collection.path();
        let (sql, args) = match filter {
            None => (
                "SELECT id, data FROM documents WHERE path = ?1 ORDER BY id",
                vec![SqlValue::Text(path)],
            ),
            Some(f) => {
                if !f
                    .field
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(BackendError::InvalidQuery(format!(
                        "unsupported filter field '{}'",
                        f.field
                    )));
                }
                let json_path = format!("$.{}", f.field);
                match to_sql_value(&f.value)? {
                    None => (
                        "SELECT id, data FROM documents
                         WHERE path = ?1 AND json_extract(data, ?2) IS NULL
                         ORDER BY id",
                        vec![SqlValue::Text(path), SqlValue::Text(json_path)],
                    ),
                    Some(v) => (
                        "SELECT id, data FROM documents
                         WHERE path = ?1 AND json_extract(data, ?2) = ?3
                         ORDER BY id",
                        vec![SqlValue::Text(path), SqlValue::Text(json_path), v],
                    ),
                }
            }
        };
        self.with_conn(move |conn| select_docs(conn, sql, args)).await
    }

    async fn get(&self, collection: &CollectionPath, id: &str) -> BackendResult<Option<Document>> {
        let path = collection.path();
        let id = id.to_string();
        self.with_conn(move |conn| {
            let data = load_body(conn, &path, &id)?;
            Ok(data.map(|data| Document { id, data }))
        })
        .await
    }

    async fn commit(&self, batch: &WriteBatch) -> BackendResult<usize> {
        if batch.len() > MAX_BATCH_DOCS {
            return Err(BackendError::BatchTooLarge {
                count: batch.len(),
                max: MAX_BATCH_DOCS,
            });
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let feed = self.feed.clone();
        let batch = batch.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut items = Vec::with_capacity(batch.len());
            for op in batch.ops() {
                if let Some(item) = apply_op(&tx, op)? {
                    items.push(item);
                }
            }
            tx.commit()?;

            let written = items.len();
            // Published while still holding the connection so feed order matches commit order.
            if written > 0 && feed.send(Arc::new(items)).is_err() {
                tracing::trace!("no watch subscribers for committed batch");
            }
            Ok(written)
        })
        .await
    }

    fn new_doc_id(&self) -> String {
        ulid::Ulid::new().to_string()
    }
}

struct SqliteChangeStream {
    rx: broadcast::Receiver<Feed>,
    path: String,
    range: ShardRange,
    initial: Option<Vec<DocChange>>,
}

#[async_trait]
impl ChangeStream for SqliteChangeStream {
    async fn next(&mut self) -> BackendResult<Vec<DocChange>> {
        if let Some(initial) = self.initial.take() {
            return Ok(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(feed) => {
                    let changes: Vec<DocChange> = feed
                        .iter()
                        .filter(|item| item.path == self.path && self.range.contains(item.shard_hash))
                        .map(|item| item.change.clone())
                        .collect();
                    if !changes.is_empty() {
                        return Ok(changes);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(BackendError::StreamLagged(n))
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BackendError::StreamClosed),
            }
        }
    }
}

fn query_shard(
    conn: &Connection,
    collection: &CollectionPath,
    range: &ShardRange,
) -> BackendResult<Vec<Document>> {
    select_docs(
        conn,
        "SELECT id, data FROM documents
         WHERE path = ?1 AND shard_hash >= ?2 AND shard_hash < ?3
         ORDER BY id",
        vec![
            SqlValue::Text(collection.path()),
            SqlValue::Integer(range.start as i64),
            SqlValue::Integer(range.end as i64),
        ],
    )
}

fn select_docs(conn: &Connection, sql: &str, args: Vec<SqlValue>) -> BackendResult<Vec<Document>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
        Ok(Document {
            id: row.get(0)?,
            data: row.get(1)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn load_body(conn: &Connection, path: &str, id: &str) -> BackendResult<Option<String>> {
    let body = conn
        .query_row(
            "SELECT data FROM documents WHERE path = ?1 AND id = ?2",
            params![path, id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(body)
}

fn apply_op(tx: &Transaction<'_>, op: &WriteOp) -> BackendResult<Option<FeedItem>> {
    match op {
        WriteOp::Set {
            collection,
            id,
            data,
        } => {
            let path = collection.path();
            let existed = load_body(tx, &path, id)?.is_some();
            upsert(tx, path, id, data, existed).map(Some)
        }
        WriteOp::Merge {
            collection,
            id,
            fields,
        } => {
            let path = collection.path();
            let prior = load_body(tx, &path, id)?;
            let existed = prior.is_some();
            let mut merged = match prior.as_deref().map(serde_json::from_str::<Value>) {
                Some(Ok(Value::Object(m))) => m,
                _ => Map::new(),
            };
            merge_fields(&mut merged, fields);
            upsert(tx, path, id, &Value::Object(merged), existed).map(Some)
        }
        WriteOp::Update {
            collection,
            id,
            fields,
            only_if,
        } => {
            let path = collection.path();
            let Some(Value::Object(mut current)) = load_checked(tx, &path, id, only_if)? else {
                return Ok(None);
            };
            merge_fields(&mut current, fields);
            upsert(tx, path, id, &Value::Object(current), true).map(Some)
        }
        WriteOp::Delete {
            collection,
            id,
            only_if,
        } => {
            let path = collection.path();
            let Some(body) = load_body(tx, &path, id)? else {
                return Ok(None);
            };
            let current = serde_json::from_str::<Value>(&body).ok();
            if !only_if.is_empty() {
                let matched = current
                    .as_ref()
                    .map_or(false, |v| only_if.iter().all(|f| f.matches(v)));
                if !matched {
                    return Ok(None);
                }
            }
            tx.execute(
                "DELETE FROM documents WHERE path = ?1 AND id = ?2",
                params![path, id],
            )?;
            let shard_hash = current.as_ref().map_or(0, shard_hash_of);
            Ok(Some(FeedItem {
                path,
                shard_hash,
                change: DocChange {
                    kind: ChangeKind::Removed,
                    doc: Document {
                        id: id.clone(),
                        data: body,
                    },
                },
            }))
        }
    }
}

/// Loads a document body if it exists and satisfies `only_if`.
fn load_checked(
    tx: &Transaction<'_>,
    path: &str,
    id: &str,
    only_if: &[FieldFilter],
) -> BackendResult<Option<Value>> {
    let Some(body) = load_body(tx, path, id)? else {
        return Ok(None);
    };
    let Ok(current) = serde_json::from_str::<Value>(&body) else {
        return Ok(None);
    };
    if only_if.iter().all(|f| f.matches(&current)) {
        Ok(Some(current))
    } else {
        Ok(None)
    }
}

fn merge_fields(target: &mut Map<String, Value>, fields: &Map<String, Value>) {
    for (k, v) in fields {
        target.insert(k.clone(), v.clone());
    }
}

fn upsert(
    tx: &Transaction<'_>,
    path: String,
    id: &str,
    data: &Value,
    existed: bool,
) -> BackendResult<FeedItem> {
    let body = serde_json::to_string(data)?;
    let shard_hash = shard_hash_of(data);
    tx.execute(
        "INSERT INTO documents(path, id, shard_hash, data) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(path, id) DO UPDATE SET shard_hash=excluded.shard_hash, data=excluded.data",
        params![path, id, i64::from(shard_hash), body],
    )?;
    Ok(FeedItem {
        path,
        shard_hash,
        change: DocChange {
            kind: if existed {
                ChangeKind::Modified
            } else {
                ChangeKind::Added
            },
            doc: Document {
                id: id.to_string(),
                data: body,
            },
        },
    })
}

fn shard_hash_of(data: &Value) -> u32 {
    data.get(SHARD_FIELD)
        .and_then(Value::as_str)
        .map(digest_hash)
        .unwrap_or(0)
}

fn to_sql_value(v: &Value) -> BackendResult<Option<SqlValue>> {
    match v {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(SqlValue::Integer(i64::from(*b)))),
        Value::String(s) => Ok(Some(SqlValue::Text(s.clone()))),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Ok(Some(SqlValue::Integer(i))),
            (None, Some(f)) => Ok(Some(SqlValue::Real(f))),
            _ => Err(BackendError::InvalidQuery(format!("unsupported number {}", n))),
        },
        other => Err(BackendError::InvalidQuery(format!(
            "cannot filter on non-scalar value {}",
            other
        ))),
    }
}
