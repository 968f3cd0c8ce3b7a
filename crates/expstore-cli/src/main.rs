use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

mod cli;

use cli::args::Cli;
use cli::commands::{dispatch, exit_codes};

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output; logs go to stderr.
    let _ = fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    let cfg = match cli::commands::resolve_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e:#}");
            std::process::exit(exit_codes::CONFIG_ERROR);
        }
    };
    init_logging(&cfg.log_level);

    let code = match dispatch(cli, cfg).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(event = "expstore.cli.failed", error = %format!("{e:#}"));
            eprintln!("error: {e:#}");
            exit_codes::code_for(&e)
        }
    };
    std::process::exit(code);
}
