#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! The stitching engine: composes the many overlapping short-window samples
//! of a keyword into one normalized long-range series per location, and
//! persists it to a standalone analytics database.

pub mod anchor;
pub mod fragment;
pub mod layer;
pub mod sink;

use tracing::info;

use trendmill_core::store::Store;
use trendmill_core::window::{DAILY_TAG, HOURLY_TAG};

use crate::anchor::{ComposeOutcome, compose};
use crate::fragment::average_duplicates;
use crate::sink::AnalyticsSink;

pub use crate::fragment::{Fragment, StitchError};
pub use crate::layer::{Layer, SplitPolicy};

/// What stitching one (keyword, location) produced.
#[derive(Debug, PartialEq, Eq)]
pub enum LocationOutcome {
    /// A series was written with this many points.
    Written {
        /// Points persisted.
        points: usize,
        /// Whether the series was produced without a daily anchor.
        degraded: bool,
    },
    /// Nothing was written.
    Skipped {
        /// Why.
        reason: String,
    },
}

/// Locations (request geos) a keyword has completed data for.
pub fn locations(store: &Store, k_id: i64) -> anyhow::Result<Vec<Option<String>>> {
    Ok(store.geos_for_keyword(k_id)?)
}

/// Stitch one (keyword, location) and persist the result.
pub fn stitch_location(
    store: &Store,
    sink: &mut AnalyticsSink,
    k_id: i64,
    geo: Option<&str>,
) -> anyhow::Result<LocationOutcome> {
    let hourly = average_duplicates(&store.fragments(k_id, geo, HOURLY_TAG)?)?;
    let daily = average_duplicates(&store.fragments(k_id, geo, DAILY_TAG)?)?;

    let state = geo.unwrap_or("");
    let (layer, degraded) = match compose(&hourly, &daily) {
        ComposeOutcome::Series(layer) => (layer, false),
        ComposeOutcome::Degraded(layer) => (layer, true),
        ComposeOutcome::Skipped { reason } => {
            return Ok(LocationOutcome::Skipped { reason });
        }
    };

    let points = sink.write_series(k_id, state, &layer)?;
    info!(k_id, state, points, degraded, "stitched series written");
    Ok(LocationOutcome::Written { points, degraded })
}
