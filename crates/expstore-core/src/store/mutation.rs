use super::ExpectationsStore;
use crate::backend::{CollectionPath, WriteBatch, MAX_BATCH_DOCS};
use crate::documents::{ChangeDoc, EntryDoc, RecordDoc, TriageRange, COMMITTED_FIELD};
use crate::errors::{BackendError, ExpStoreError, Result};
use crate::model::{Delta, Id};
use crate::retry::with_retries;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Entries per write batch. Each entry also writes one change document and
/// the first batch carries the record, so this keeps every batch within
/// `MAX_BATCH_DOCS`.
pub(crate) const ENTRIES_PER_BATCH: usize = MAX_BATCH_DOCS / 2 - 1;

impl ExpectationsStore {
    /// Applies a triage action as one audited record.
    ///
    /// Entries and their change documents are written in batches; the record
    /// is created uncommitted in the first batch and flipped to committed
    /// once every batch has landed. A failure part way leaves earlier
    /// batches applied and the record uncommitted.
    pub async fn add_change(&self, deltas: &[Delta], user: &str) -> Result<()> {
        self.commit_deltas(deltas, user, None).await.map(|_| ())
    }

    /// Returns the id of the written record, or `None` for an empty action.
    pub(crate) async fn commit_deltas(
        &self,
        deltas: &[Delta],
        user: &str,
        undo_of: Option<&str>,
    ) -> Result<Option<String>> {
        self.require_writable()?;
        let deltas = collapse(deltas)?;
        if deltas.is_empty() {
            return Ok(None);
        }
        self.ensure_entry_cache().await?;

        let now = self.now();
        let (entries, mut changes) = self.make_entries_and_changes(now, &deltas);

        let partition = self.partition.id();
        let record_id = self.backend.new_doc_id();
        for change in &mut changes {
            change.record_id = record_id.clone();
        }
        let record = RecordDoc {
            user: user.to_string(),
            ts: now,
            changes: entries.len(),
            committed: false,
            undo_of: undo_of.map(str::to_string),
        };

        let entries_path = CollectionPath::entries(&self.partition);
        let records_path = CollectionPath::records(&self.partition);
        let changes_path = CollectionPath::changes(&self.partition);
        let serialization =
            |e: serde_json::Error| ExpStoreError::backend("add_change", partition, BackendError::from(e));

        for (i, (entry_chunk, change_chunk)) in entries
            .chunks(ENTRIES_PER_BATCH)
            .zip(changes.chunks(ENTRIES_PER_BATCH))
            .enumerate()
        {
            let mut batch = WriteBatch::new();
            if i == 0 {
                batch
                    .set(&records_path, &record_id, &record)
                    .map_err(serialization)?;
            }
            for (entry, change) in entry_chunk.iter().zip(change_chunk) {
                batch
                    .set(&entries_path, &entry.doc_id(), entry)
                    .map_err(serialization)?;
                batch
                    .set(&changes_path, &self.backend.new_doc_id(), change)
                    .map_err(serialization)?;
            }
            let backend = &self.backend;
            let batch = &batch;
            with_retries("add_change", partition, self.retry, move || {
                backend.commit(batch)
            })
            .await?;
        }

        let mut fields = Map::new();
        fields.insert(COMMITTED_FIELD.to_string(), Value::Bool(true));
        let mut flip = WriteBatch::new();
        flip.merge(&records_path, &record_id, fields);
        let backend = &self.backend;
        let flip = &flip;
        with_retries("commit_triage_record", partition, self.commit_retry, move || {
            backend.commit(flip)
        })
        .await?;

        tracing::info!(
            event = "expstore.triage.committed",
            partition = %partition,
            record_id = %record_id,
            user = %user,
            changes = entries.len(),
            undo_of = undo_of.unwrap_or(""),
            "committed triage record"
        );
        Ok(Some(record_id))
    }

    /// Builds the new entry state and audit change for each delta from the
    /// cached state.
    fn make_entries_and_changes(
        &self,
        now: DateTime<Utc>,
        deltas: &[Delta],
    ) -> (Vec<EntryDoc>, Vec<ChangeDoc>) {
        let mut entries = Vec::with_capacity(deltas.len());
        let mut changes = Vec::with_capacity(deltas.len());
        for delta in deltas {
            let mut entry = self
                .state
                .entry(&delta.id())
                .unwrap_or_else(|| EntryDoc::empty(&delta.grouping, &delta.digest));
            let range = TriageRange::all_time(delta.label);
            let label_before = entry.upsert_range(range);
            entry.updated = now;
            entry.needs_gc = false;

            changes.push(ChangeDoc {
                record_id: String::new(),
                grouping: delta.grouping.clone(),
                digest: delta.digest.clone(),
                affected_range: range,
                label_before,
            });
            entries.push(entry);
        }
        (entries, changes)
    }
}

/// Validates deltas and keeps the last label given for each identity, in
/// first-seen order.
fn collapse(deltas: &[Delta]) -> Result<Vec<Delta>> {
    let mut out: Vec<Delta> = Vec::with_capacity(deltas.len());
    let mut seen: HashMap<Id, usize> = HashMap::new();
    for delta in deltas {
        if delta.grouping.is_empty() || delta.digest.is_empty() {
            return Err(ExpStoreError::InvalidInput(format!(
                "delta needs a grouping and a digest, got {:?}",
                delta
            )));
        }
        match seen.get(&delta.id()) {
            Some(&i) => out[i].label = delta.label,
            None => {
                seen.insert(delta.id(), out.len());
                out.push(delta.clone());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Label;

    #[test]
    fn batches_fit_the_commit_cap() {
        assert_eq!(ENTRIES_PER_BATCH, 249);
        assert!(ENTRIES_PER_BATCH * 2 + 1 <= MAX_BATCH_DOCS);
    }

    #[test]
    fn collapse_keeps_last_label_per_identity() {
        let deltas = vec![
            Delta::new("g", "a", Label::Positive),
            Delta::new("g", "b", Label::Negative),
            Delta::new("g", "a", Label::Negative),
        ];
        let out = collapse(&deltas).unwrap();
        assert_eq!(
            out,
            vec![
                Delta::new("g", "a", Label::Negative),
                Delta::new("g", "b", Label::Negative),
            ]
        );
    }

    #[test]
    fn collapse_rejects_blank_identity() {
        let err = collapse(&[Delta::new("", "a", Label::Positive)]).unwrap_err();
        assert!(matches!(err, ExpStoreError::InvalidInput(_)));
    }
}
