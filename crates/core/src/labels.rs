//! Reconstruction of the sample timestamps the upstream service implicitly
//! attaches to each window.
//!
//! The service never ships labels alongside a stored sample vector, so both
//! ingestion validation and stitching re-derive them from
//! `(window, sample count)`. The derivation is pure and restartable: the same
//! inputs always yield the same sequence.

use chrono::{DateTime, Duration, Utc};

use crate::window::{Resolution, TimeWindow};

/// Raw cadence must sit strictly within a quarter step of the snapped
/// resolution, and the reconstructed window end within half a step of the
/// requested end. Anything looser is rejected rather than guessed at.
const CADENCE_SLACK_DIVISOR: i64 = 4;
const END_DRIFT_DIVISOR: i64 = 2;

/// A `(window, sample count)` pair that matches no supported cadence.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LabelError {
    /// The observed step width is not close to any supported resolution.
    #[error("cadence of {step_secs}s across {count} samples matches no supported resolution")]
    UnsupportedCadence {
        /// Observed step width in seconds.
        step_secs: i64,
        /// Number of samples in the payload.
        count: usize,
    },
    /// The snapped cadence does not land the sequence on the window end.
    #[error("reconstructed end drifts {drift_secs}s from the window end at a {step_secs}s step")]
    EndDrift {
        /// Distance between reconstructed and requested end, in seconds.
        drift_secs: i64,
        /// Snapped step width in seconds.
        step_secs: i64,
    },
}

/// Reconstruct the ordered timestamps labeling `count` samples of `window`.
///
/// An empty payload reconstructs to an empty sequence. Otherwise the step is
/// the window duration divided by the sample count, snapped to the nearest
/// supported [`Resolution`]; ambiguous cadences fail instead of guessing.
pub fn reconstruct_labels(
    window: TimeWindow,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, LabelError> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let duration = window.duration_secs();
    let raw_step = duration as f64 / count as f64;
    let resolution = nearest_resolution(raw_step);
    let step = resolution.seconds();

    if (raw_step - step as f64).abs() >= (step / CADENCE_SLACK_DIVISOR) as f64 {
        return Err(LabelError::UnsupportedCadence {
            step_secs: raw_step.round() as i64,
            count,
        });
    }

    let reconstructed_end = window.start.timestamp() + step * count as i64;
    let drift = (reconstructed_end - window.end.timestamp()).abs();
    if drift > step / END_DRIFT_DIVISOR {
        return Err(LabelError::EndDrift {
            drift_secs: drift,
            step_secs: step,
        });
    }

    Ok((0..count)
        .map(|i| window.start + Duration::seconds(step * i as i64))
        .collect())
}

/// The supported cadence of an already-labeled series, if it has one.
///
/// Derived from the first inter-label step; series with fewer than two
/// labels carry no cadence.
pub fn resolution_of(labels: &[DateTime<Utc>]) -> Option<Resolution> {
    let step = (*labels.get(1)? - *labels.first()?).num_seconds();
    Resolution::ALL.into_iter().find(|r| r.seconds() == step)
}

fn nearest_resolution(raw_step: f64) -> Resolution {
    let mut best = Resolution::Hourly;
    let mut best_dist = f64::INFINITY;
    for res in Resolution::ALL {
        let dist = (raw_step - res.seconds() as f64).abs();
        if dist < best_dist {
            best = res;
            best_dist = dist;
        }
    }
    best
}
