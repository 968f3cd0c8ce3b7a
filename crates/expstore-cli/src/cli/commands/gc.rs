use super::{exit_codes, open_store, print_json};
use crate::cli::args::{GcMarkArgs, ScopeArgs, TouchArgs};
use chrono::{DateTime, Duration, Utc};
use expstore_core::{ExpStoreError, Id, StoreConfig};
use serde_json::json;

pub async fn touch(args: TouchArgs, cfg: &StoreConfig) -> anyhow::Result<i32> {
    let store = open_store(cfg, &args.scope)?;
    let ids: Vec<Id> = args
        .digests
        .iter()
        .map(|d| Id::new(args.grouping.as_str(), d.as_str()))
        .collect();
    let touched = store.update_last_used(&ids, Utc::now()).await?;
    print_json(&json!({ "touched": touched }))?;
    Ok(exit_codes::SUCCESS)
}

pub async fn mark(args: GcMarkArgs, cfg: &StoreConfig) -> anyhow::Result<i32> {
    let threshold = threshold_before(Utc::now(), args.older_than_days)?;
    let store = open_store(cfg, &args.scope)?;
    let marked = store
        .mark_unused_entries_for_gc(args.label, threshold)
        .await?;
    print_json(&json!({
        "marked": marked,
        "label": args.label,
        "threshold": threshold.to_rfc3339(),
    }))?;
    Ok(exit_codes::SUCCESS)
}

pub async fn collect(scope: ScopeArgs, cfg: &StoreConfig) -> anyhow::Result<i32> {
    let store = open_store(cfg, &scope)?;
    let deleted = store.garbage_collect().await?;
    print_json(&json!({ "deleted": deleted }))?;
    Ok(exit_codes::SUCCESS)
}

/// `now` minus `days`, rejecting negative or unrepresentable ages.
fn threshold_before(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>, ExpStoreError> {
    let out_of_range =
        || ExpStoreError::InvalidInput(format!("--older-than-days {days} is out of range"));
    if days < 0 {
        return Err(ExpStoreError::InvalidInput(
            "--older-than-days must not be negative".to_string(),
        ));
    }
    let age = Duration::try_days(days).ok_or_else(out_of_range)?;
    now.checked_sub_signed(age).ok_or_else(out_of_range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn threshold_rejects_unrepresentable_ages() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            threshold_before(now, 90).unwrap(),
            Utc.with_ymd_and_hms(2023, 12, 2, 0, 0, 0).unwrap()
        );
        assert!(matches!(
            threshold_before(now, -1),
            Err(ExpStoreError::InvalidInput(_))
        ));
        assert!(threshold_before(now, i64::MAX).is_err());
        assert!(threshold_before(now, 1_000_000_000).is_err());
    }
}
