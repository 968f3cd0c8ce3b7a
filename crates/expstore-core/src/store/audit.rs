use super::ExpectationsStore;
use crate::backend::{CollectionPath, Document, FieldFilter};
use crate::documents::{
    decode_change, decode_record, ChangeDoc, RecordDoc, COMMITTED_FIELD, GROUPING_FIELD,
    RECORD_ID_FIELD,
};
use crate::errors::{ExpStoreError, Result};
use crate::model::{Delta, TriageDetail, TriageHistory, TriageLogEntry};
use crate::retry::with_retries;
use std::collections::HashMap;

impl ExpectationsStore {
    /// Triage records of this partition, newest first.
    ///
    /// Returns one page and the total number of records. Uncommitted records
    /// are included and flagged.
    pub async fn query_log(
        &self,
        offset: usize,
        size: usize,
        details: bool,
    ) -> Result<(Vec<TriageLogEntry>, usize)> {
        let mut records = self.records(None).await?;
        records.sort_by(|a, b| b.1.ts.cmp(&a.1.ts).then_with(|| b.0.cmp(&a.0)));
        let total = records.len();

        let mut page: Vec<TriageLogEntry> = records
            .into_iter()
            .skip(offset)
            .take(size)
            .map(|(id, r)| log_entry(id, r))
            .collect();

        if details {
            for entry in &mut page {
                entry.details = self
                    .changes_for_record(&entry.id)
                    .await?
                    .into_iter()
                    .map(|c| TriageDetail {
                        grouping: c.grouping,
                        digest: c.digest,
                        label: c.affected_range.label,
                    })
                    .collect();
                entry.details.sort_by(|a, b| {
                    (&a.grouping, &a.digest).cmp(&(&b.grouping, &b.digest))
                });
            }
        }
        Ok((page, total))
    }

    /// Records that never flipped to committed, oldest first.
    pub async fn incomplete_records(&self) -> Result<Vec<TriageLogEntry>> {
        let mut records = self
            .records(Some(&FieldFilter::eq(COMMITTED_FIELD, false)))
            .await?;
        records.sort_by(|a, b| a.1.ts.cmp(&b.1.ts).then_with(|| a.0.cmp(&b.0)));
        Ok(records.into_iter().map(|(id, r)| log_entry(id, r)).collect())
    }

    /// Restores every entry touched by `record_id` to the label it had
    /// before, as a new record attributed to `user`. Returns the new record id.
    pub async fn undo_change(&self, record_id: &str, user: &str) -> Result<String> {
        self.require_writable()?;
        let changes = self.changes_for_record(record_id).await?;
        if changes.is_empty() {
            return Err(ExpStoreError::NotFound(format!(
                "no changes recorded for triage record {record_id}"
            )));
        }
        let deltas: Vec<Delta> = changes
            .into_iter()
            .map(|c| Delta::new(c.grouping, c.digest, c.label_before))
            .collect();

        tracing::info!(
            event = "expstore.triage.undo",
            partition = %self.partition,
            record_id = %record_id,
            user = %user,
            changes = deltas.len(),
            "undoing triage record"
        );
        self.commit_deltas(&deltas, user, Some(record_id))
            .await?
            .ok_or_else(|| ExpStoreError::NotFound(format!("triage record {record_id}")))
    }

    /// Committed label changes of one entry, newest first.
    pub async fn triage_history(&self, grouping: &str, digest: &str) -> Result<Vec<TriageHistory>> {
        let changes_path = CollectionPath::changes(&self.partition);
        let records_path = CollectionPath::records(&self.partition);
        let filter = FieldFilter::eq(GROUPING_FIELD, grouping);
        let docs = self.find_docs("triage_history", &changes_path, Some(&filter)).await?;

        let mut records: HashMap<String, Option<RecordDoc>> = HashMap::new();
        let mut history = Vec::new();
        for change in decode_all(self.partition.id(), docs, decode_change) {
            if change.digest != digest {
                continue;
            }
            if !records.contains_key(&change.record_id) {
                let backend = &self.backend;
                let path = &records_path;
                let id = change.record_id.as_str();
                let doc = with_retries("triage_history", self.partition.id(), self.retry, move || {
                    backend.get(path, id)
                })
                .await?;
                let record = doc.and_then(|d| match decode_record(&d) {
                    Ok(r) => Some(r),
                    Err(e) => {
                        tracing::error!(partition = %self.partition, error = %e, "skipping corrupt record");
                        None
                    }
                });
                records.insert(change.record_id.clone(), record);
            }
            if let Some(Some(record)) = records.get(&change.record_id) {
                if record.committed {
                    history.push(TriageHistory {
                        user: record.user.clone(),
                        ts: record.ts,
                        label: change.affected_range.label,
                    });
                }
            }
        }
        history.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(history)
    }

    async fn records(&self, filter: Option<&FieldFilter>) -> Result<Vec<(String, RecordDoc)>> {
        let path = CollectionPath::records(&self.partition);
        let docs = self.find_docs("query_log", &path, filter).await?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| match decode_record(&doc) {
                Ok(r) => Some((doc.id, r)),
                Err(e) => {
                    tracing::error!(partition = %self.partition, error = %e, "skipping corrupt record");
                    None
                }
            })
            .collect())
    }

    async fn changes_for_record(&self, record_id: &str) -> Result<Vec<ChangeDoc>> {
        let path = CollectionPath::changes(&self.partition);
        let filter = FieldFilter::eq(RECORD_ID_FIELD, record_id);
        let docs = self.find_docs("query_changes", &path, Some(&filter)).await?;
        Ok(decode_all(self.partition.id(), docs, decode_change))
    }

    async fn find_docs(
        &self,
        op: &str,
        path: &CollectionPath,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<Document>> {
        let backend = &self.backend;
        with_retries(op, self.partition.id(), self.retry, move || {
            backend.find(path, filter)
        })
        .await
    }
}

fn log_entry(id: String, record: RecordDoc) -> TriageLogEntry {
    TriageLogEntry {
        id,
        user: record.user,
        ts: record.ts,
        change_count: record.changes,
        committed: record.committed,
        undo_of: record.undo_of,
        details: Vec::new(),
    }
}

fn decode_all<T>(
    partition: &str,
    docs: Vec<Document>,
    decode: impl Fn(&Document) -> Result<T>,
) -> Vec<T> {
    docs.iter()
        .filter_map(|doc| match decode(doc) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!(partition = %partition, error = %e, "skipping corrupt document");
                None
            }
        })
        .collect()
}
