mod cli;

use anyhow::Context as _;
use clap::Parser as _;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use trendmill_core::store::Store;
use trendmill_stitch::sink::AnalyticsSink;
use trendmill_stitch::{LocationOutcome, locations, stitch_location};

use crate::cli::Cli;

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let store = Store::open(&cli.db)
        .with_context(|| format!("open store {}", cli.db.display()))?;
    let mut sink = AnalyticsSink::open(&cli.out)
        .with_context(|| format!("open analytics database {}", cli.out.display()))?;

    let geos = locations(&store, cli.keyword)?;
    if geos.is_empty() {
        warn!(k_id = cli.keyword, "keyword has no completed data; nothing to stitch");
        return Ok(());
    }

    let bar = ProgressBar::new(geos.len() as u64).with_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut written = 0usize;
    let mut skipped = 0usize;
    for geo in &geos {
        bar.set_message(geo.clone().unwrap_or_else(|| "worldwide".to_string()));
        match stitch_location(&store, &mut sink, cli.keyword, geo.as_deref())? {
            LocationOutcome::Written { .. } => written += 1,
            LocationOutcome::Skipped { reason } => {
                skipped += 1;
                warn!(k_id = cli.keyword, geo = geo.as_deref(), %reason, "location skipped");
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    info!(
        k_id = cli.keyword,
        locations = geos.len(),
        written,
        skipped,
        out = %cli.out.display(),
        "stitching finished"
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
