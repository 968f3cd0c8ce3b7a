use super::{open_store, print_json};
use crate::cli::args::GetArgs;
use expstore_core::StoreConfig;

pub async fn run(args: GetArgs, cfg: &StoreConfig) -> anyhow::Result<i32> {
    let store = open_store(cfg, &args.scope)?;
    let exp = store.get().await?;
    print_json(&exp.as_deltas())?;
    eprintln!("{} labeled entries in {}", exp.len(), store.partition());
    Ok(super::exit_codes::SUCCESS)
}
