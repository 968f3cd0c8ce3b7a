use super::{exit_codes, open_store, print_json};
use crate::cli::args::{HistoryArgs, LogArgs, ScopeArgs, UndoArgs};
use expstore_core::StoreConfig;
use serde_json::json;

pub async fn log(args: LogArgs, cfg: &StoreConfig) -> anyhow::Result<i32> {
    let store = open_store(cfg, &args.scope)?;
    let (entries, total) = store.query_log(args.offset, args.size, args.details).await?;
    print_json(&json!({
        "partition": store.partition().id(),
        "offset": args.offset,
        "total": total,
        "entries": entries,
    }))?;
    Ok(exit_codes::SUCCESS)
}

pub async fn undo(args: UndoArgs, cfg: &StoreConfig) -> anyhow::Result<i32> {
    let store = open_store(cfg, &args.scope)?;
    let record_id = store.undo_change(&args.record, &args.user).await?;
    print_json(&json!({ "undone": args.record, "record": record_id }))?;
    Ok(exit_codes::SUCCESS)
}

pub async fn history(args: HistoryArgs, cfg: &StoreConfig) -> anyhow::Result<i32> {
    let store = open_store(cfg, &args.scope)?;
    let history = store.triage_history(&args.grouping, &args.digest).await?;
    print_json(&history)?;
    Ok(exit_codes::SUCCESS)
}

/// Exits non-zero when stuck records exist so cron jobs can alert on it.
pub async fn incomplete(scope: ScopeArgs, cfg: &StoreConfig) -> anyhow::Result<i32> {
    let store = open_store(cfg, &scope)?;
    let records = store.incomplete_records().await?;
    print_json(&records)?;
    if records.is_empty() {
        Ok(exit_codes::SUCCESS)
    } else {
        eprintln!(
            "{} incomplete triage record(s) in {}",
            records.len(),
            store.partition()
        );
        Ok(exit_codes::FAILURE)
    }
}
