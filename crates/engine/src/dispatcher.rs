//! The dispatcher control loop.
//!
//! Single-threaded and cooperative: pace, claim one request, fetch through
//! the round-robin-next transport, stage, ingest, repeat. Parallelism comes
//! only from running multiple dispatcher processes against the same store;
//! the conditional lock keeps them off each other's rows.
//!
//! Only upstream 500s are absorbed. Every other failure releases the claimed
//! request and crashes the process; staged payloads survive the crash and
//! are replayed on the next startup.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use trendmill_core::model::{Claim, StagedRow};
use trendmill_core::store::Store;

use crate::governor::Governor;
use crate::ingest::{IngestOutcome, ingest_staged};
use crate::transport::{FetchError, Transport};

/// Cooperative stop signal shared between the loop and signal handlers.
#[derive(Debug, Default)]
pub struct StopFlag {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopFlag {
    /// Fresh, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake any pending fetch.
    pub fn request_stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Loop configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Exit cleanly once the queue drains instead of polling forever.
    pub exit_when_idle: bool,
    /// Sleep between polls of an empty queue.
    pub idle_sleep: Duration,
    /// Override the dispatch interval; `None` computes `60/N + 1` seconds
    /// from the transport count.
    pub pace_interval: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            exit_when_idle: false,
            idle_sleep: Duration::from_secs(1),
            pace_interval: None,
        }
    }
}

/// Per-process scheduling counters, logged at shutdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    /// Requests locked by this process.
    pub claimed: u64,
    /// Requests fully ingested.
    pub completed: u64,
    /// Upstream 500s absorbed (request released each time).
    pub server_errors: u64,
    /// Payloads staged but left for manual repair.
    pub left_for_repair: u64,
    /// Advisory candidates lost to another dispatcher.
    pub raced: u64,
}

/// What one loop iteration did.
#[derive(Debug, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing claimable.
    Idle,
    /// Lost the claim race; no side effect.
    Raced,
    /// Claimed, fetched and ingested.
    Completed,
    /// Claimed, fetched, staged, but left for repair.
    LeftForRepair,
    /// Claimed, got an upstream 500, released.
    Released,
}

/// The claim-dispatch-ingest loop.
pub struct Dispatcher {
    store: Store,
    transports: Vec<Transport>,
    config: DispatcherConfig,
    stop: Arc<StopFlag>,
    governor: Governor,
    rr_index: usize,
    stats: DispatchStats,
}

impl Dispatcher {
    /// Build a dispatcher over a store handle and the active transports.
    pub fn new(
        store: Store,
        transports: Vec<Transport>,
        config: DispatcherConfig,
        stop: Arc<StopFlag>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!transports.is_empty(), "dispatcher needs at least one transport");
        let governor = match config.pace_interval {
            Some(interval) => Governor::with_interval(interval),
            None => Governor::for_transports(transports.len()),
        };
        info!(
            transports = transports.len(),
            interval_secs = governor.interval().as_secs_f64(),
            "dispatcher ready"
        );
        Ok(Self {
            store,
            transports,
            config,
            stop,
            governor,
            rr_index: 0,
            stats: DispatchStats::default(),
        })
    }

    /// Counters so far.
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Run until the queue drains (with `exit_when_idle`), a stop is
    /// requested, or a fatal error crashes the loop.
    pub async fn run(mut self) -> anyhow::Result<DispatchStats> {
        loop {
            if self.stop.is_stopped() {
                info!("stop requested; shutting down");
                break;
            }
            match self.run_iteration().await? {
                IterationOutcome::Idle => {
                    if self.config.exit_when_idle {
                        info!("queue drained; exiting");
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idle_sleep) => {}
                        _ = self.stop.notified() => {}
                    }
                }
                IterationOutcome::Raced
                | IterationOutcome::Completed
                | IterationOutcome::LeftForRepair
                | IterationOutcome::Released => {}
            }
        }
        Ok(self.stats)
    }

    /// One iteration: pace, claim, dispatch, handle the outcome.
    pub async fn run_iteration(&mut self) -> anyhow::Result<IterationOutcome> {
        self.governor.pace().await;

        let claimed = match self.store.claim_next(Utc::now())? {
            Claim::Empty => return Ok(IterationOutcome::Idle),
            Claim::Raced => {
                self.stats.raced += 1;
                debug!("lost claim race; restarting iteration");
                return Ok(IterationOutcome::Raced);
            }
            Claim::Claimed(claimed) => claimed,
        };
        self.stats.claimed += 1;

        let r_id = claimed.request.r_id;
        let window = claimed.request.window.format_for_fetch();
        let transport = self.transports[self.rr_index].clone();
        let f_id = self.store.intern_fetcher(
            &transport.name(),
            transport.host(),
            &claimed.request.api_flavor,
        )?;
        debug!(
            r_id,
            transport = %transport.name(),
            %window,
            keyword = %claimed.keyword,
            "dispatching"
        );

        let stop = Arc::clone(&self.stop);
        let result = tokio::select! {
            res = transport.fetch(&window, &claimed.keyword, claimed.request.geo.as_deref()) => res,
            _ = stop.notified() => {
                self.release(r_id)?;
                anyhow::bail!("interrupted while fetching request {r_id}");
            }
        };
        // The index advances regardless of outcome.
        self.rr_index = (self.rr_index + 1) % self.transports.len();

        match result {
            Ok(bytes) => {
                let raw = match String::from_utf8(bytes) {
                    Ok(raw) => raw,
                    Err(err) => {
                        self.release(r_id)?;
                        anyhow::bail!("request {r_id}: fetcher emitted non-UTF-8 output: {err}");
                    }
                };
                let fetched_at = Utc::now().timestamp();
                let rfo_id = self
                    .store
                    .stage_raw(r_id, claimed.k_id, f_id, &raw, fetched_at)?;
                let staged = StagedRow {
                    rfo_id,
                    raw,
                    f_id,
                    r_id,
                    k_id: claimed.k_id,
                    fetched_at,
                };
                match ingest_staged(&mut self.store, &staged, Utc::now())? {
                    IngestOutcome::Ingested { resolution } => {
                        self.stats.completed += 1;
                        info!(r_id, ?resolution, keyword = %claimed.keyword, "request ingested");
                        Ok(IterationOutcome::Completed)
                    }
                    IngestOutcome::LeftForRepair { reason } => {
                        self.stats.left_for_repair += 1;
                        warn!(r_id, %reason, "payload staged but not ingested; left for repair");
                        Ok(IterationOutcome::LeftForRepair)
                    }
                }
            }
            Err(FetchError::Response { code: 500, msg }) => {
                self.release(r_id)?;
                self.stats.server_errors += 1;
                warn!(r_id, %msg, "upstream 500; request released");
                Ok(IterationOutcome::Released)
            }
            Err(err) => {
                // Committed release first; the crash follows.
                self.release(r_id)?;
                Err(anyhow::Error::new(err)
                    .context(format!("fatal fetch failure for request {r_id}")))
            }
        }
    }

    fn release(&self, r_id: i64) -> anyhow::Result<()> {
        if !self.store.release_request(r_id)? {
            warn!(r_id, "release found the request not running");
        }
        Ok(())
    }
}
