//! Schema types for the three per-partition collections.

use crate::backend::Document;
use crate::errors::{ExpStoreError, Result};
use crate::model::{Digest, Grouping, Id, Label};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DIGEST_FIELD: &str = "digest";
pub const GROUPING_FIELD: &str = "grouping";
pub const COMMITTED_FIELD: &str = "committed";
pub const RECORD_ID_FIELD: &str = "record_id";
pub const LAST_USED_FIELD: &str = "last_used";
pub const NEEDS_GC_FIELD: &str = "needs_gc";
pub const UPDATED_FIELD: &str = "updated";

pub const BEGINNING_OF_TIME: i32 = 0;
pub const END_OF_TIME: i32 = i32::MAX;

/// A label that holds over `[first_index, last_index]` of the commit sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageRange {
    pub first_index: i32,
    pub last_index: i32,
    pub label: Label,
}

impl TriageRange {
    /// The range every triage currently writes: all commits.
    pub fn all_time(label: Label) -> Self {
        Self {
            first_index: BEGINNING_OF_TIME,
            last_index: END_OF_TIME,
            label,
        }
    }

    fn same_bounds(&self, other: &TriageRange) -> bool {
        self.first_index == other.first_index && self.last_index == other.last_index
    }
}

/// Persisted triage state of one (grouping, digest).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDoc {
    pub grouping: Grouping,
    pub digest: Digest,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub last_used: DateTime<Utc>,
    /// Sorted by `first_index`; no two ranges share both bounds.
    #[serde(default)]
    pub ranges: Vec<TriageRange>,
    #[serde(default)]
    pub needs_gc: bool,
}

impl EntryDoc {
    /// Zero-valued entry for a pair that has never been triaged.
    pub fn empty(grouping: &str, digest: &str) -> Self {
        Self {
            grouping: grouping.to_string(),
            digest: digest.to_string(),
            updated: DateTime::<Utc>::default(),
            last_used: DateTime::<Utc>::default(),
            ranges: Vec::new(),
            needs_gc: false,
        }
    }

    pub fn id(&self) -> Id {
        Id::new(self.grouping.clone(), self.digest.clone())
    }

    /// Deterministic document key so updates overwrite the same document.
    pub fn doc_id(&self) -> String {
        entry_doc_id(&self.grouping, &self.digest)
    }

    /// Label of the first range; later ranges are not consulted yet.
    pub fn current_label(&self) -> Option<Label> {
        self.ranges.first().map(|r| r.label)
    }

    /// Replaces the range with identical bounds or inserts it in order.
    /// Returns the label that range held before.
    pub fn upsert_range(&mut self, range: TriageRange) -> Label {
        if let Some(existing) = self.ranges.iter_mut().find(|r| r.same_bounds(&range)) {
            let before = existing.label;
            *existing = range;
            return before;
        }
        self.ranges.push(range);
        self.ranges.sort_by_key(|r| r.first_index);
        Label::Untriaged
    }
}

pub fn entry_doc_id(grouping: &str, digest: &str) -> String {
    format!("{}|{}", grouping, digest).replace('/', "-")
}

/// Audit record of one mutated entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeDoc {
    pub record_id: String,
    pub grouping: Grouping,
    pub digest: Digest,
    pub affected_range: TriageRange,
    pub label_before: Label,
}

/// One atomic triage action. `committed` flips to true only after every
/// entry and change of the action has been written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDoc {
    pub user: String,
    pub ts: DateTime<Utc>,
    pub changes: usize,
    pub committed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_of: Option<String>,
}

pub(crate) fn decode<T: DeserializeOwned>(kind: &'static str, doc: &Document) -> Result<T> {
    doc.decode().map_err(|e| ExpStoreError::Corrupt {
        kind,
        id: doc.id.clone(),
        message: e.to_string(),
    })
}

/// Decodes an entry, rejecting entries without ranges.
pub fn decode_entry(doc: &Document) -> Result<EntryDoc> {
    let entry: EntryDoc = decode("entry", doc)?;
    if entry.grouping.is_empty() || entry.ranges.is_empty() {
        return Err(ExpStoreError::Corrupt {
            kind: "entry",
            id: doc.id.clone(),
            message: "entry has an empty grouping or no ranges".into(),
        });
    }
    Ok(entry)
}

pub fn decode_change(doc: &Document) -> Result<ChangeDoc> {
    decode("change", doc)
}

pub fn decode_record(doc: &Document) -> Result<RecordDoc> {
    decode("record", doc)
}
