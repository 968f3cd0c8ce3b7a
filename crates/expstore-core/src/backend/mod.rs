//! The document database boundary.
//!
//! Each partition owns three collections (entries, triage records, triage
//! changes) addressed as `expstore_partitions_v3/<partition>/<collection>`.

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteDocumentStore;

use crate::errors::BackendError;
use crate::partition::Partition;
use crate::shard::ShardRange;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

pub const PARTITIONS_ROOT: &str = "expstore_partitions_v3";
pub const ENTRIES_COLLECTION: &str = "entries";
pub const RECORDS_COLLECTION: &str = "triage_records";
pub const CHANGES_COLLECTION: &str = "triage_changes";

/// Maximum number of document writes in one atomic commit.
pub const MAX_BATCH_DOCS: usize = 500;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath {
    partition: String,
    collection: &'static str,
}

impl CollectionPath {
    pub fn new(partition: &Partition, collection: &'static str) -> Self {
        Self {
            partition: partition.id().to_string(),
            collection,
        }
    }

    pub fn entries(partition: &Partition) -> Self {
        Self::new(partition, ENTRIES_COLLECTION)
    }

    pub fn records(partition: &Partition) -> Self {
        Self::new(partition, RECORDS_COLLECTION)
    }

    pub fn changes(partition: &Partition) -> Self {
        Self::new(partition, CHANGES_COLLECTION)
    }

    pub fn path(&self) -> String {
        format!("{}/{}/{}", PARTITIONS_ROOT, self.partition, self.collection)
    }
}

/// A stored document: its id and raw JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: String,
}

impl Document {
    /// Decodes the body into a schema type. Corrupt bodies are an ordinary error.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One document change delivered by a watch stream. Removals carry the last body.
#[derive(Debug, Clone, PartialEq)]
pub struct DocChange {
    pub kind: ChangeKind,
    pub doc: Document,
}

/// Predicate selecting the entries of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardQuery {
    pub collection: CollectionPath,
    pub range: ShardRange,
}

impl ShardQuery {
    pub fn for_shards(collection: &CollectionPath, ranges: &[ShardRange]) -> Vec<ShardQuery> {
        ranges
            .iter()
            .map(|range| ShardQuery {
                collection: collection.clone(),
                range: *range,
            })
            .collect()
    }
}

/// Top-level field equality filter. A missing field compares equal to null.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

impl FieldFilter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn matches(&self, doc: &Value) -> bool {
        doc.get(&self.field).unwrap_or(&Value::Null) == &self.value
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or fully replace a document.
    Set {
        collection: CollectionPath,
        id: String,
        data: Value,
    },
    /// Overwrite the given top-level fields, creating the document if needed.
    Merge {
        collection: CollectionPath,
        id: String,
        fields: Map<String, Value>,
    },
    /// Overwrite the given top-level fields of an existing document whose
    /// stored fields match every `only_if` filter. Otherwise a no-op.
    Update {
        collection: CollectionPath,
        id: String,
        fields: Map<String, Value>,
        only_if: Vec<FieldFilter>,
    },
    /// Remove a document if it exists and matches every `only_if` filter.
    Delete {
        collection: CollectionPath,
        id: String,
        only_if: Vec<FieldFilter>,
    },
}

/// Writes applied together by [`DocumentStore::commit`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize>(
        &mut self,
        collection: &CollectionPath,
        id: &str,
        doc: &T,
    ) -> Result<(), serde_json::Error> {
        self.ops.push(WriteOp::Set {
            collection: collection.clone(),
            id: id.to_string(),
            data: serde_json::to_value(doc)?,
        });
        Ok(())
    }

    pub fn merge(&mut self, collection: &CollectionPath, id: &str, fields: Map<String, Value>) {
        self.ops.push(WriteOp::Merge {
            collection: collection.clone(),
            id: id.to_string(),
            fields,
        });
    }

    pub fn update(&mut self, collection: &CollectionPath, id: &str, fields: Map<String, Value>) {
        self.update_if(collection, id, fields, Vec::new());
    }

    pub fn update_if(
        &mut self,
        collection: &CollectionPath,
        id: &str,
        fields: Map<String, Value>,
        only_if: Vec<FieldFilter>,
    ) {
        self.ops.push(WriteOp::Update {
            collection: collection.clone(),
            id: id.to_string(),
            fields,
            only_if,
        });
    }

    pub fn delete(&mut self, collection: &CollectionPath, id: &str) {
        self.delete_if(collection, id, Vec::new());
    }

    pub fn delete_if(&mut self, collection: &CollectionPath, id: &str, only_if: Vec<FieldFilter>) {
        self.ops.push(WriteOp::Delete {
            collection: collection.clone(),
            id: id.to_string(),
            only_if,
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

/// Ordered producer of change batches for one shard.
///
/// The first batch is the complete current contents of the shard.
#[async_trait]
pub trait ChangeStream: Send {
    async fn next(&mut self) -> BackendResult<Vec<DocChange>>;
}

/// Remote document database shared by every partition, shard and mutation.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn query(&self, query: &ShardQuery) -> BackendResult<Vec<Document>>;

    async fn watch(&self, query: &ShardQuery) -> BackendResult<Box<dyn ChangeStream>>;

    async fn find(
        &self,
        collection: &CollectionPath,
        filter: Option<&FieldFilter>,
    ) -> BackendResult<Vec<Document>>;

    async fn get(&self, collection: &CollectionPath, id: &str) -> BackendResult<Option<Document>>;

    /// Applies every write in `batch` atomically. Preconditions are checked
    /// inside the same transaction. Returns how many documents were written;
    /// skipped updates and deletes are not counted.
    async fn commit(&self, batch: &WriteBatch) -> BackendResult<usize>;

    fn new_doc_id(&self) -> String;
}
