//! Fragment preparation: duplicate averaging and label attachment.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use trendmill_core::labels::reconstruct_labels;
use trendmill_core::model::FragmentRow;
use trendmill_core::window::TimeWindow;

/// One completed request's time-series output with its reconstructed labels.
///
/// Fragments whose labels cannot be reconstructed carry an empty label
/// vector; the layering pass isolates them.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Representative request id (first of the averaged duplicates).
    pub r_id: i64,
    /// The sampling window.
    pub window: TimeWindow,
    /// Reconstructed sample timestamps; empty when unreconstructible.
    pub labels: Vec<DateTime<Utc>>,
    /// Sample values, averaged across duplicates.
    pub values: Vec<f64>,
}

/// Stitching failure.
#[derive(Debug, thiserror::Error)]
pub enum StitchError {
    /// Duplicate requests for one window disagree on sample count.
    #[error(
        "duplicates of request {r_id}'s window carry {got} samples where {expected} were expected"
    )]
    MismatchedDuplicates {
        /// Representative request id of the group.
        r_id: i64,
        /// Sample count of the first duplicate.
        expected: usize,
        /// Conflicting sample count.
        got: usize,
    },
}

/// Collapse duplicate requests (exact same window) into one fragment each by
/// element-wise averaging, ordered by window start.
pub fn average_duplicates(rows: &[FragmentRow]) -> Result<Vec<Fragment>, StitchError> {
    let mut groups: BTreeMap<(i64, i64), Vec<&FragmentRow>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.window.start.timestamp(), row.window.end.timestamp()))
            .or_default()
            .push(row);
    }

    let mut fragments = Vec::with_capacity(groups.len());
    for group in groups.values() {
        let first = group[0];
        let len = first.samples.len();
        for row in group.iter().skip(1) {
            if row.samples.len() != len {
                return Err(StitchError::MismatchedDuplicates {
                    r_id: first.r_id,
                    expected: len,
                    got: row.samples.len(),
                });
            }
        }

        let mut values = vec![0.0; len];
        for row in group {
            for (acc, sample) in values.iter_mut().zip(&row.samples) {
                *acc += *sample as f64;
            }
        }
        for acc in &mut values {
            *acc /= group.len() as f64;
        }

        let labels = match reconstruct_labels(first.window, len) {
            Ok(labels) => labels,
            Err(err) => {
                warn!(r_id = first.r_id, %err, "fragment labels unreconstructible");
                Vec::new()
            }
        };

        fragments.push(Fragment {
            r_id: first.r_id,
            window: first.window,
            labels,
            values,
        });
    }
    Ok(fragments)
}
