mod common;

use common::{memory_backend, store_on, test_config};
use expstore_core::backend::{CollectionPath, DocumentStore, WriteBatch};
use expstore_core::documents::{decode_entry, entry_doc_id};
use expstore_core::{AccessMode, Delta, ExpStoreError, ExpectationsStore, Id, Label, Partition};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn fresh_store_reads_empty_then_sees_writes() -> anyhow::Result<()> {
    let store = store_on(memory_backend()?, &test_config())?;
    assert!(store.get().await?.is_empty());

    store
        .add_change(
            &[
                Delta::new("circle", "aaa", Label::Positive),
                Delta::new("square", "bbb", Label::Negative),
            ],
            "alice@example.com",
        )
        .await?;

    let exp = store.get().await?;
    assert_eq!(exp.len(), 2);
    assert_eq!(exp.classification("circle", "aaa"), Label::Positive);
    assert_eq!(exp.classification("square", "bbb"), Label::Negative);
    assert_eq!(exp.classification("circle", "zzz"), Label::Untriaged);

    let (log, total) = store.query_log(0, 10, false).await?;
    assert_eq!(total, 1);
    assert_eq!(log[0].user, "alice@example.com");
    assert_eq!(log[0].change_count, 2);
    assert!(log[0].committed);
    Ok(())
}

#[tokio::test]
async fn repeated_triage_keeps_one_range() -> anyhow::Result<()> {
    let backend = memory_backend()?;
    let store = store_on(backend.clone(), &test_config())?;
    let delta = [Delta::new("circle", "aaa", Label::Positive)];
    store.add_change(&delta, "alice").await?;
    store.add_change(&delta, "alice").await?;
    store
        .add_change(&[Delta::new("circle", "aaa", Label::Negative)], "bob")
        .await?;

    let doc = backend
        .get(
            &CollectionPath::entries(&Partition::master()),
            &entry_doc_id("circle", "aaa"),
        )
        .await?
        .expect("entry document");
    let entry = decode_entry(&doc)?;
    assert_eq!(entry.ranges.len(), 1);
    assert_eq!(entry.current_label(), Some(Label::Negative));

    let (_, total) = store.query_log(0, 10, false).await?;
    assert_eq!(total, 3);
    Ok(())
}

#[tokio::test]
async fn get_copy_is_independent_of_the_snapshot() -> anyhow::Result<()> {
    let store = store_on(memory_backend()?, &test_config())?;
    store
        .add_change(&[Delta::new("circle", "aaa", Label::Positive)], "alice")
        .await?;
    store.initialize().await?;

    let mut copy = store.get_copy().await?;
    copy.set("circle", "aaa", Label::Negative);
    copy.set("circle", "new", Label::Positive);

    let shared = store.get().await?;
    assert_eq!(shared.classification("circle", "aaa"), Label::Positive);
    assert_eq!(shared.len(), 1);
    // Unchanged state serves the same snapshot.
    assert!(Arc::ptr_eq(&shared, &store.get().await?));
    store.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn read_only_store_rejects_every_mutation() -> anyhow::Result<()> {
    let backend = memory_backend()?;
    let writer = store_on(backend.clone(), &test_config())?;
    writer
        .add_change(&[Delta::new("circle", "aaa", Label::Positive)], "alice")
        .await?;

    let mut cfg = test_config();
    cfg.access_mode = AccessMode::ReadOnly;
    let reader = store_on(backend, &cfg)?;

    let delta = [Delta::new("circle", "bbb", Label::Positive)];
    assert!(reader.add_change(&delta, "mallory").await.unwrap_err().is_read_only());
    let (log, _) = reader.query_log(0, 1, false).await?;
    assert!(reader.undo_change(&log[0].id, "mallory").await.unwrap_err().is_read_only());
    assert!(reader
        .update_last_used(&[Id::new("circle", "aaa")], chrono::Utc::now())
        .await
        .unwrap_err()
        .is_read_only());
    assert!(reader
        .mark_unused_entries_for_gc(Label::Positive, chrono::Utc::now())
        .await
        .unwrap_err()
        .is_read_only());
    assert!(reader.garbage_collect().await.unwrap_err().is_read_only());

    // Reads still work and nothing was written.
    let exp = reader.get().await?;
    assert_eq!(exp.len(), 1);
    assert_eq!(exp.classification("circle", "bbb"), Label::Untriaged);

    let cl = reader.for_change_list("7", "gerrit")?.expect("cl store");
    assert_eq!(cl.mode(), AccessMode::ReadOnly);
    assert!(cl.add_change(&delta, "mallory").await.is_err());
    Ok(())
}

#[tokio::test]
async fn blank_identities_are_rejected() -> anyhow::Result<()> {
    let store = store_on(memory_backend()?, &test_config())?;
    let err = store
        .add_change(&[Delta::new("circle", "", Label::Positive)], "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, ExpStoreError::InvalidInput(_)));

    // An empty action writes nothing.
    store.add_change(&[], "alice").await?;
    let (_, total) = store.query_log(0, 10, false).await?;
    assert_eq!(total, 0);
    Ok(())
}

#[tokio::test]
async fn change_list_partitions_are_isolated() -> anyhow::Result<()> {
    let master = store_on(memory_backend()?, &test_config())?;
    assert!(master.for_change_list("", "gerrit")?.is_none());
    assert!(master.for_change_list("123", "")?.is_none());

    let cl = master.for_change_list("123", "gerrit")?.expect("cl store");
    assert_eq!(cl.partition().id(), "gerrit_123");
    assert_eq!(cl.num_shards(), 2);
    assert!(!cl.is_syncing());

    cl.add_change(&[Delta::new("circle", "aaa", Label::Negative)], "carol")
        .await?;
    master
        .add_change(&[Delta::new("circle", "bbb", Label::Positive)], "dave")
        .await?;

    let on_master = master.get().await?;
    assert_eq!(on_master.classification("circle", "aaa"), Label::Untriaged);
    assert_eq!(on_master.classification("circle", "bbb"), Label::Positive);

    let on_cl = cl.get().await?;
    assert_eq!(on_cl.len(), 1);
    assert_eq!(on_cl.classification("circle", "aaa"), Label::Negative);

    let other = master.for_change_list("124", "gerrit")?.expect("cl store");
    assert!(other.get().await?.is_empty());
    assert_eq!(cl.query_log(0, 10, false).await?.1, 1);
    Ok(())
}

#[tokio::test]
async fn corrupt_entries_are_skipped() -> anyhow::Result<()> {
    let backend = memory_backend()?;
    let store = store_on(backend.clone(), &test_config())?;
    store
        .add_change(&[Delta::new("circle", "good", Label::Positive)], "alice")
        .await?;

    let mut batch = WriteBatch::new();
    let entries = CollectionPath::entries(&Partition::master());
    batch.set(
        &entries,
        "circle|bad",
        &json!({"grouping": "circle", "digest": "bad", "updated": "yesterday"}),
    )?;
    batch.set(
        &entries,
        "circle|noranges",
        &json!({"grouping": "circle", "digest": "noranges", "updated": "2024-01-01T00:00:00Z", "ranges": []}),
    )?;
    backend.commit(&batch).await?;

    let exp = store.get().await?;
    assert_eq!(exp.len(), 1);
    assert_eq!(exp.classification("circle", "good"), Label::Positive);

    store.initialize().await?;
    assert_eq!(store.get().await?.len(), 1);
    store.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn open_uses_the_configured_database() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = test_config();
    cfg.db_path = dir.path().join("exp.db");

    let store = ExpectationsStore::open(&cfg, None)?;
    store
        .add_change(&[Delta::new("circle", "aaa", Label::Positive)], "alice")
        .await?;
    drop(store);

    let reopened = ExpectationsStore::open(&cfg, None)?;
    assert_eq!(
        reopened.get().await?.classification("circle", "aaa"),
        Label::Positive
    );
    Ok(())
}
