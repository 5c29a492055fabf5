mod cli;

use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use clap::Parser as _;
use tracing::{info, warn};

use trendmill_core::store::Store;
use trendmill_engine::dispatcher::{Dispatcher, DispatcherConfig, StopFlag};
use trendmill_engine::recovery::{confirm_replay, recover_staged};
use trendmill_engine::transport::{Transport, load_transports};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut store = Store::open(&cli.db)
        .with_context(|| format!("open store {}", cli.db.display()))?;

    let staged = store.staged_rows()?;
    if !staged.is_empty() {
        if confirm_replay(staged.len())? {
            let report = recover_staged(&mut store, Utc::now())?;
            info!(
                replayed = report.replayed,
                left = report.left,
                "staging recovery finished"
            );
        } else {
            warn!(staged = staged.len(), "staged payloads left untouched");
        }
    }

    let transports = if cli.local {
        vec![Transport::popen(cli.script.clone())]
    } else {
        load_transports(&cli.transports)?
    };

    let stop = Arc::new(StopFlag::new());
    spawn_ctrl_c_handler(stop.clone());

    let dispatcher = Dispatcher::new(
        store,
        transports,
        DispatcherConfig {
            exit_when_idle: cli.exit,
            ..DispatcherConfig::default()
        },
        stop,
    )?;

    let stats = dispatcher.run().await?;
    info!(
        claimed = stats.claimed,
        completed = stats.completed,
        server_errors = stats.server_errors,
        left_for_repair = stats.left_for_repair,
        raced = stats.raced,
        "dispatcher done"
    );
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn spawn_ctrl_c_handler(stop: Arc<StopFlag>) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if stop.is_stopped() {
                eprintln!("Stop requested again — exiting immediately.");
                std::process::exit(130);
            }
            eprintln!(
                "Stop requested — releasing in-flight work before exiting (press CTRL+C again to exit immediately)."
            );
            stop.request_stop();
        }
    });
}
