use clap::Parser;
use color_eyre::eyre::{
    Result,
    eyre,
};
use fhe_spin::{
    config::{
        SessionConfig,
        expand_path,
    },
    types::parse_eth,
};
use std::path::Path;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

mod client;

#[derive(Parser, Debug)]
#[command(version, about = "Confidential spin-wheel client over a sandbox network", long_about = None)]
struct Args {
    /// Directory for the key store.
    #[arg(long, default_value = "~/.fhe-spin")]
    state_dir: String,

    /// Log directory; defaults to `<state-dir>/logs`.
    #[arg(long)]
    log_dir: Option<String>,

    /// JSON file with session policy overrides.
    #[arg(long)]
    config: Option<String>,

    /// Seed for the sandbox network.
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// ETH held by the sandbox prize pool.
    #[arg(long, default_value = "1")]
    pool_eth: String,
}

fn init_tracing(log_dir: &Path) -> WorkerGuard {
    let appender = rolling::daily(log_dir, "fhe-spin.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let state_dir = expand_path(&args.state_dir);
    let log_dir = args
        .log_dir
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(|| state_dir.join("logs"));
    std::fs::create_dir_all(&log_dir)?;
    let _guard = init_tracing(&log_dir);
    tracing::info!(state_dir = %state_dir.display(), seed = args.seed, "starting fhe-spin client");

    let session = SessionConfig::load(args.config.as_deref())?;
    let pool_wei = parse_eth(&args.pool_eth)
        .ok_or_else(|| eyre!("invalid --pool-eth amount '{}'", args.pool_eth))?;
    client::run_app(client::AppConfig {
        state_dir,
        session,
        seed: args.seed,
        pool_wei,
    })
    .await
}
