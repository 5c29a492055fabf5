//! Startup recovery of staged payloads.
//!
//! A crash between staging and the structured write leaves rows in
//! `raw_fetcher_output`. On the next startup the operator is prompted and,
//! on confirmation, each staged row is replayed through the ingestion
//! pipeline with its recorded fetch timestamp intact.

use std::io::Write as _;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use trendmill_core::store::Store;

use crate::ingest::{IngestOutcome, ingest_staged};

/// What a recovery pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Rows replayed to completion.
    pub replayed: usize,
    /// Rows that still fail validation and stay staged.
    pub left: usize,
}

/// Replay every staged row through ingestion. The caller has already
/// obtained operator confirmation.
pub fn recover_staged(store: &mut Store, now: DateTime<Utc>) -> anyhow::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for staged in store.staged_rows()? {
        match ingest_staged(store, &staged, now)? {
            IngestOutcome::Ingested { resolution } => {
                report.replayed += 1;
                info!(r_id = staged.r_id, ?resolution, "replayed staged payload");
            }
            IngestOutcome::LeftForRepair { reason } => {
                report.left += 1;
                warn!(r_id = staged.r_id, %reason, "staged payload still fails validation");
            }
        }
    }
    Ok(report)
}

/// Ask the operator whether to replay `count` staged rows.
pub fn confirm_replay(count: usize) -> anyhow::Result<bool> {
    let mut out = std::io::stdout();
    write!(
        out,
        "{count} staged payload(s) from a previous run found. Replay them now? [y/N] "
    )?;
    out.flush()?;

    let mut buf = String::new();
    std::io::stdin().read_line(&mut buf)?;
    Ok(matches!(buf.trim(), "y" | "Y" | "yes"))
}
