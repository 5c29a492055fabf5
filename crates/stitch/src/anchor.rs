//! Cross-resolution anchoring.
//!
//! Multiple hourly layers have no common amplitude; a daily series spanning
//! them is used as the anchor. Each hourly layer is rescaled so that its
//! per-day averages match the daily anchor over the days they share. When no
//! anchor exists the engine degrades or skips, but never invents values.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::warn;

use crate::fragment::Fragment;
use crate::layer::{Layer, SplitPolicy, layer_fragments};

/// Result of composing one (keyword, location) series.
#[derive(Debug, PartialEq)]
pub enum ComposeOutcome {
    /// One continuous series, ready to persist.
    Series(Layer),
    /// A continuous series produced without a daily anchor, by pure
    /// concatenation of the hourly fragments.
    Degraded(Layer),
    /// No series could be produced; the reason has been logged.
    Skipped {
        /// Why the pair was skipped.
        reason: String,
    },
}

/// Stitch the hourly fragments of one (keyword, location), anchoring across
/// layers with the daily fragments when needed.
pub fn compose(hourly: &[Fragment], daily: &[Fragment]) -> ComposeOutcome {
    let mut hourly_layers = layer_fragments(hourly, SplitPolicy::strict());
    if hourly_layers.is_empty() {
        return ComposeOutcome::Skipped {
            reason: "no hourly fragments".to_string(),
        };
    }
    if hourly_layers.len() == 1 {
        return ComposeOutcome::Series(hourly_layers.remove(0));
    }

    if daily.is_empty() {
        warn!("no daily anchor fragments; emitting concatenated hourly series");
        let mut layers = layer_fragments(hourly, SplitPolicy::concat());
        return match layers.pop() {
            Some(layer) => ComposeOutcome::Degraded(layer),
            None => ComposeOutcome::Skipped {
                reason: "no hourly fragments".to_string(),
            },
        };
    }

    let daily_layers = layer_fragments(daily, SplitPolicy::anchor());
    if daily_layers.len() != 1 {
        let reason = format!(
            "daily anchor stitching produced {} layers instead of one",
            daily_layers.len()
        );
        warn!(%reason, "anchoring failed");
        return ComposeOutcome::Skipped { reason };
    }
    let anchor: BTreeMap<NaiveDate, f64> = daily_layers[0]
        .points
        .iter()
        .map(|(at, value)| (at.date_naive(), *value))
        .collect();

    let mut merged: BTreeMap<_, f64> = BTreeMap::new();
    for layer in &hourly_layers {
        let Some(scale) = anchor_scale(layer, &anchor) else {
            let reason = "daily anchor is zero across an hourly layer's days".to_string();
            warn!(%reason, "anchoring failed");
            return ComposeOutcome::Skipped { reason };
        };
        for (at, value) in &layer.points {
            merged.entry(*at).or_insert(value * scale);
        }
    }

    ComposeOutcome::Series(Layer {
        points: merged.into_iter().collect(),
    })
}

/// Scale factor aligning an hourly layer's per-day averages with the daily
/// anchor over their shared days, or `None` when either side is zero there.
fn anchor_scale(layer: &Layer, anchor: &BTreeMap<NaiveDate, f64>) -> Option<f64> {
    let mut per_day: BTreeMap<NaiveDate, (f64, u32)> = BTreeMap::new();
    for (at, value) in &layer.points {
        let slot = per_day.entry(at.date_naive()).or_insert((0.0, 0));
        slot.0 += value;
        slot.1 += 1;
    }

    let mut anchor_sum = 0.0;
    let mut layer_sum = 0.0;
    for (day, (sum, count)) in &per_day {
        if let Some(daily_value) = anchor.get(day) {
            anchor_sum += daily_value;
            layer_sum += sum / f64::from(*count);
        }
    }

    (anchor_sum > 0.0 && layer_sum > 0.0).then(|| anchor_sum / layer_sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use trendmill_core::labels::reconstruct_labels;
    use trendmill_core::window::TimeWindow;

    fn day_of_hourlies(r_id: i64, day: u32, value: f64) -> Fragment {
        let start = Utc.with_ymd_and_hms(2022, 1, day, 0, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + chrono::Duration::hours(24)).unwrap();
        Fragment {
            r_id,
            window,
            labels: reconstruct_labels(window, 24).unwrap(),
            values: vec![value; 24],
        }
    }

    fn daily_span(r_id: i64, from_day: u32, values: Vec<f64>) -> Fragment {
        let start = Utc.with_ymd_and_hms(2022, 1, from_day, 0, 0, 0).unwrap();
        let window =
            TimeWindow::new(start, start + chrono::Duration::days(values.len() as i64)).unwrap();
        Fragment {
            r_id,
            window,
            labels: reconstruct_labels(window, values.len()).unwrap(),
            values,
        }
    }

    #[test]
    fn single_layer_needs_no_anchor() {
        let hourly = [day_of_hourlies(1, 1, 5.0)];
        match compose(&hourly, &[]) {
            ComposeOutcome::Series(layer) => {
                assert_eq!(layer.points.len(), 24);
                assert!(layer.points.iter().all(|(_, v)| *v == 5.0));
            }
            other => panic!("expected series, got {other:?}"),
        }
    }

    #[test]
    fn disjoint_layers_are_rescaled_to_the_daily_anchor() {
        // Day 1 at amplitude 2, day 3 at amplitude 8; the daily anchor says
        // both days sit at 4.
        let hourly = [day_of_hourlies(1, 1, 2.0), day_of_hourlies(2, 3, 8.0)];
        let daily = [daily_span(3, 1, vec![4.0, 4.0, 4.0, 4.0])];

        match compose(&hourly, &daily) {
            ComposeOutcome::Series(layer) => {
                assert_eq!(layer.points.len(), 48);
                assert!(layer.points.iter().all(|(_, v)| (*v - 4.0).abs() < 1e-9));
            }
            other => panic!("expected anchored series, got {other:?}"),
        }
    }

    #[test]
    fn missing_daily_data_degrades_to_concatenation() {
        let hourly = [day_of_hourlies(1, 1, 2.0), day_of_hourlies(2, 3, 8.0)];
        match compose(&hourly, &[]) {
            ComposeOutcome::Degraded(layer) => {
                assert_eq!(layer.points.len(), 48);
                let values: Vec<f64> = layer.points.iter().map(|(_, v)| *v).collect();
                assert_eq!(values[0], 2.0);
                assert_eq!(values[47], 8.0);
            }
            other => panic!("expected degraded series, got {other:?}"),
        }
    }

    #[test]
    fn zero_daily_anchor_skips_the_pair() {
        let hourly = [day_of_hourlies(1, 1, 2.0), day_of_hourlies(2, 3, 8.0)];
        let daily = [daily_span(3, 1, vec![0.0, 0.0, 0.0, 0.0])];
        assert!(matches!(
            compose(&hourly, &daily),
            ComposeOutcome::Skipped { .. }
        ));
    }

    #[test]
    fn fractured_daily_anchor_skips_the_pair() {
        let hourly = [day_of_hourlies(1, 1, 2.0), day_of_hourlies(2, 5, 8.0)];
        // Two daily fragments whose overlap is zero on one side: even in
        // anchor mode this splits, leaving more than one daily layer.
        let daily = [
            daily_span(3, 1, vec![4.0, 0.0]),
            daily_span(4, 2, vec![0.0, 4.0]),
        ];
        assert!(matches!(
            compose(&hourly, &daily),
            ComposeOutcome::Skipped { .. }
        ));
    }

    #[test]
    fn no_hourly_fragments_is_a_skip() {
        assert!(matches!(
            compose(&[], &[]),
            ComposeOutcome::Skipped { .. }
        ));
    }
}
