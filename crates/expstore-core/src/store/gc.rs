use super::ExpectationsStore;
use crate::backend::{CollectionPath, FieldFilter, WriteBatch, MAX_BATCH_DOCS};
use crate::documents::{EntryDoc, LAST_USED_FIELD, NEEDS_GC_FIELD, UPDATED_FIELD};
use crate::errors::{BackendError, ExpStoreError, Result};
use crate::model::{Id, Label};
use crate::retry::with_retries;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

impl ExpectationsStore {
    /// Records that the given entries were referenced at `ts` and clears
    /// their GC flag. Unknown identities, and entries deleted before the
    /// write lands, are ignored and not counted. Labels and `updated` are
    /// untouched, so no change notification fires.
    pub async fn update_last_used(&self, ids: &[Id], ts: DateTime<Utc>) -> Result<usize> {
        self.require_writable()?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.ensure_entry_cache().await?;

        let doc_ids: Vec<String> = {
            let cache = self.state.entries.read();
            ids.iter()
                .filter_map(|id| cache.get(id).map(EntryDoc::doc_id))
                .collect()
        };
        let last_used = self.json_value("update_last_used", ts)?;

        let mut fields = Map::new();
        fields.insert(LAST_USED_FIELD.to_string(), last_used);
        fields.insert(NEEDS_GC_FIELD.to_string(), Value::Bool(false));
        let updates = doc_ids
            .into_iter()
            .map(|id| (id, fields.clone(), Vec::new()))
            .collect();
        self.update_in_batches("update_last_used", updates).await
    }

    /// Flags entries currently labeled `label` that have been neither used
    /// nor modified since `threshold`. Returns the number newly flagged.
    pub async fn mark_unused_entries_for_gc(
        &self,
        label: Label,
        threshold: DateTime<Utc>,
    ) -> Result<usize> {
        self.require_writable()?;
        // Read the backend directly: a lagging cache could miss a recent touch.
        let entries = self.load_entries().await?;
        let mut fields = Map::new();
        fields.insert(NEEDS_GC_FIELD.to_string(), Value::Bool(true));

        let mut updates = Vec::new();
        for e in entries.iter().filter(|e| {
            !e.needs_gc
                && e.current_label() == Some(label)
                && e.last_used < threshold
                && e.updated < threshold
        }) {
            // Skip the entry if it was retriaged or touched after we read it.
            let updated = self.json_value("mark_unused_entries_for_gc", e.updated)?;
            let last_used = self.json_value("mark_unused_entries_for_gc", e.last_used)?;
            let only_if = vec![
                FieldFilter::eq(UPDATED_FIELD, updated),
                FieldFilter::eq(LAST_USED_FIELD, last_used),
            ];
            updates.push((e.doc_id(), fields.clone(), only_if));
        }

        let marked = self
            .update_in_batches("mark_unused_entries_for_gc", updates)
            .await?;
        tracing::info!(
            event = "expstore.gc.marked",
            partition = %self.partition,
            label = %label,
            threshold = %threshold.to_rfc3339(),
            marked,
            "flagged unused entries"
        );
        Ok(marked)
    }

    /// Deletes every entry still flagged for GC. The flag is rechecked when
    /// each delete commits, so an entry touched or retriaged in between
    /// survives. Audit records are kept.
    pub async fn garbage_collect(&self) -> Result<usize> {
        self.require_writable()?;
        let entries = self.load_entries().await?;
        let doc_ids: Vec<String> = entries
            .iter()
            .filter(|e| e.needs_gc)
            .map(EntryDoc::doc_id)
            .collect();

        let path = CollectionPath::entries(&self.partition);
        let mut deleted = 0;
        for chunk in doc_ids.chunks(MAX_BATCH_DOCS) {
            let mut batch = WriteBatch::new();
            for id in chunk {
                batch.delete_if(&path, id, vec![FieldFilter::eq(NEEDS_GC_FIELD, true)]);
            }
            deleted += self.commit_batch("garbage_collect", &batch).await?;
        }
        tracing::info!(
            event = "expstore.gc.collected",
            partition = %self.partition,
            deleted,
            skipped = doc_ids.len() - deleted,
            "garbage collected entries"
        );
        Ok(deleted)
    }

    /// Writes existing entries only; returns how many were updated.
    async fn update_in_batches(
        &self,
        op: &str,
        updates: Vec<(String, Map<String, Value>, Vec<FieldFilter>)>,
    ) -> Result<usize> {
        let path = CollectionPath::entries(&self.partition);
        let mut written = 0;
        for chunk in updates.chunks(MAX_BATCH_DOCS) {
            let mut batch = WriteBatch::new();
            for (id, fields, only_if) in chunk {
                batch.update_if(&path, id, fields.clone(), only_if.clone());
            }
            written += self.commit_batch(op, &batch).await?;
        }
        Ok(written)
    }

    fn json_value(&self, op: &str, ts: DateTime<Utc>) -> Result<Value> {
        serde_json::to_value(ts)
            .map_err(|e| ExpStoreError::backend(op, self.partition.id(), BackendError::from(e)))
    }

    async fn commit_batch(&self, op: &str, batch: &WriteBatch) -> Result<usize> {
        let backend = &self.backend;
        with_retries(op, self.partition.id(), self.retry, move || {
            backend.commit(batch)
        })
        .await
    }
}
