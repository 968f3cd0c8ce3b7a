pub mod audit;
pub mod gc;
pub mod get;
pub mod triage;

use crate::cli::args::{Cli, Command, GcSub, ScopeArgs};
use anyhow::Context;
use expstore_core::{load_config, ExpectationsStore, StoreConfig};

pub mod exit_codes {
    use expstore_core::ExpStoreError;

    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const READ_ONLY: i32 = 3;
    pub const NOT_FOUND: i32 = 4;

    pub fn code_for(err: &anyhow::Error) -> i32 {
        match err.downcast_ref::<ExpStoreError>() {
            Some(ExpStoreError::Config(_)) | Some(ExpStoreError::InvalidInput(_)) => CONFIG_ERROR,
            Some(ExpStoreError::ReadOnly) => READ_ONLY,
            Some(ExpStoreError::NotFound(_)) => NOT_FOUND,
            _ => FAILURE,
        }
    }
}

/// Config file (or defaults), then `EXPSTORE_*` env, then flags.
pub fn resolve_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let cfg = match &cli.config {
        Some(path) => load_config(path, cli.strict)?,
        None => StoreConfig::default(),
    };
    let mut cfg = cfg.with_env();
    if let Some(db) = &cli.db {
        cfg.db_path = db.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

pub async fn dispatch(cli: Cli, cfg: StoreConfig) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Get(args) => get::run(args, &cfg).await,
        Command::Triage(args) => triage::run(args, &cfg).await,
        Command::Log(args) => audit::log(args, &cfg).await,
        Command::Undo(args) => audit::undo(args, &cfg).await,
        Command::History(args) => audit::history(args, &cfg).await,
        Command::Incomplete(scope) => audit::incomplete(scope, &cfg).await,
        Command::Touch(args) => gc::touch(args, &cfg).await,
        Command::Gc(args) => match args.cmd {
            GcSub::Mark(args) => gc::mark(args, &cfg).await,
            GcSub::Collect(scope) => gc::collect(scope, &cfg).await,
        },
    }
}

/// Opens the master store, or the change-list store when a scope is given.
pub(crate) fn open_store(cfg: &StoreConfig, scope: &ScopeArgs) -> anyhow::Result<ExpectationsStore> {
    let master = ExpectationsStore::open(cfg, None)
        .with_context(|| format!("failed to open {}", cfg.db_path.display()))?;
    Ok(master
        .for_change_list(&scope.change_list, &scope.crs)?
        .unwrap_or(master))
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
