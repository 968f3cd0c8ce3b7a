//! In-memory entry cache and the derived read-model snapshot.
//!
//! Lock order is always entries before snapshot; a read-model rebuild never
//! holds the snapshot lock while it reads entries.

use crate::backend::{ChangeKind, DocChange};
use crate::documents::{decode, decode_entry, EntryDoc};
use crate::model::{Expectations, Id, Label};
use crate::notifier::ChangeNotifier;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
pub(crate) struct EntryCache {
    map: RwLock<HashMap<Id, EntryDoc>>,
    // Bumped under the write lock on every material change.
    generation: AtomicU64,
}

impl EntryCache {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, HashMap<Id, EntryDoc>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Id, EntryDoc>> {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct SnapshotCache {
    current: Mutex<Option<Arc<Expectations>>>,
}

impl SnapshotCache {
    fn lock(&self) -> MutexGuard<'_, Option<Arc<Expectations>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn invalidate(&self) {
        *self.lock() = None;
    }

    fn get(&self) -> Option<Arc<Expectations>> {
        self.lock().clone()
    }
}

/// Everything the sync workers and callers share.
pub(crate) struct CacheState {
    pub(crate) entries: EntryCache,
    pub(crate) snapshot: SnapshotCache,
    notifier: Option<Arc<dyn ChangeNotifier>>,
    partition: String,
}

#[derive(Deserialize)]
struct EntryKey {
    grouping: String,
    digest: String,
}

impl CacheState {
    pub(crate) fn new(partition: &str, notifier: Option<Arc<dyn ChangeNotifier>>) -> Self {
        Self {
            entries: EntryCache::default(),
            snapshot: SnapshotCache::default(),
            notifier,
            partition: partition.to_string(),
        }
    }

    /// Swaps the whole cache for a freshly loaded entry set.
    pub(crate) fn replace(&self, loaded: Vec<EntryDoc>) {
        let mut map = self.entries.write();
        *map = loaded.into_iter().map(|e| (e.id(), e)).collect();
        self.entries.bump();
        self.snapshot.invalidate();
    }

    /// Applies one watch batch. Returns the identities that were notified.
    ///
    /// An entry is a material change when it is new or its `updated`
    /// timestamp moved; metadata-only updates refresh the cache silently.
    pub(crate) fn apply_changes(&self, changes: Vec<DocChange>) -> Vec<Id> {
        let mut to_notify = Vec::new();
        let mut map = self.entries.write();
        for change in changes {
            match change.kind {
                ChangeKind::Removed => match decode::<EntryKey>("entry", &change.doc) {
                    Ok(key) => {
                        let id = Id::new(key.grouping, key.digest);
                        if map.remove(&id).is_some() {
                            to_notify.push(id);
                        }
                    }
                    Err(e) => tracing::error!(
                        event = "expstore.corrupt_entry",
                        partition = %self.partition,
                        error = %e,
                        "skipping removal of undecodable entry"
                    ),
                },
                ChangeKind::Added | ChangeKind::Modified => match decode_entry(&change.doc) {
                    Ok(entry) => {
                        let id = entry.id();
                        let material = map
                            .get(&id)
                            .map_or(true, |existing| existing.updated != entry.updated);
                        map.insert(id.clone(), entry);
                        if material {
                            to_notify.push(id);
                        }
                    }
                    Err(e) => tracing::error!(
                        event = "expstore.corrupt_entry",
                        partition = %self.partition,
                        error = %e,
                        "skipping corrupt entry"
                    ),
                },
            }
        }

        if !to_notify.is_empty() {
            self.entries.bump();
            self.snapshot.invalidate();
            // Still under the write lock: subscribers never see a half-applied batch.
            if let Some(notifier) = &self.notifier {
                for id in &to_notify {
                    notifier.notify_change(id);
                }
            }
        }
        drop(map);
        to_notify
    }

    pub(crate) fn entry(&self, id: &Id) -> Option<EntryDoc> {
        self.entries.read().get(id).cloned()
    }

    /// Projects the current entries into a fresh read model.
    pub(crate) fn project(&self) -> Expectations {
        project(self.entries.read().values(), &self.partition)
    }

    /// Returns the cached snapshot, rebuilding it if it was invalidated.
    pub(crate) fn snapshot_or_rebuild(&self) -> Arc<Expectations> {
        if let Some(snapshot) = self.snapshot.get() {
            return snapshot;
        }

        let (generation, built) = {
            let map = self.entries.read();
            (
                self.entries.generation(),
                Arc::new(project(map.values(), &self.partition)),
            )
        };

        let mut current = self.snapshot.lock();
        if let Some(existing) = current.as_ref() {
            return Arc::clone(existing);
        }
        // A newer change invalidated the cache while we were building; serve
        // what we built without installing it.
        if generation == self.entries.generation() {
            *current = Some(Arc::clone(&built));
        }
        built
    }
}

pub(crate) fn project<'a>(
    entries: impl IntoIterator<Item = &'a EntryDoc>,
    partition: &str,
) -> Expectations {
    let mut e = Expectations::new();
    for entry in entries {
        match entry.current_label() {
            // Explicitly untriaged entries read the same as absent ones.
            Some(Label::Untriaged) => {}
            Some(label) => e.set(entry.grouping.clone(), entry.digest.clone(), label),
            None => tracing::warn!(
                partition = %partition,
                id = %entry.doc_id(),
                "ignoring entry without ranges"
            ),
        }
    }
    e
}
