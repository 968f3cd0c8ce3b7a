use super::{exit_codes, open_store};
use crate::cli::args::TriageArgs;
use expstore_core::{Delta, StoreConfig};

pub async fn run(args: TriageArgs, cfg: &StoreConfig) -> anyhow::Result<i32> {
    let store = open_store(cfg, &args.scope)?;
    let deltas: Vec<Delta> = args
        .digests
        .iter()
        .map(|d| Delta::new(args.grouping.as_str(), d.as_str(), args.label))
        .collect();
    store.add_change(&deltas, &args.user).await?;
    eprintln!(
        "labeled {} digest(s) of {} as {} in {}",
        deltas.len(),
        args.grouping,
        args.label,
        store.partition()
    );
    Ok(exit_codes::SUCCESS)
}
