//! Overlap layering and in-layer rescaling.
//!
//! Fragments are scanned in window order and chained while they overlap and
//! carry an anchoring signal. Within a chain, each successor is rescaled by
//! the ratio of overlap maxima and appended, preferring the values already
//! accumulated on the overlap.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::fragment::Fragment;

/// One continuous stitched series.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    /// `(label, value)` points in chronological order.
    pub points: Vec<(DateTime<Utc>, f64)>,
}

impl Layer {
    /// Labels of this layer.
    pub fn labels(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.points.iter().map(|(at, _)| *at)
    }
}

/// Which conditions break a chain.
#[derive(Debug, Clone, Copy)]
pub struct SplitPolicy {
    /// Split when consecutive fragments share no labels.
    pub on_gap: bool,
    /// Split when the overlap carries no anchoring signal (a zero maximum
    /// on either side).
    pub on_zero_signal: bool,
}

impl SplitPolicy {
    /// Normal hourly stitching: split on gaps and on zero overlaps.
    pub fn strict() -> Self {
        Self {
            on_gap: true,
            on_zero_signal: true,
        }
    }

    /// Daily anchor stitching: gaps chain through, zero overlaps still split.
    pub fn anchor() -> Self {
        Self {
            on_gap: false,
            on_zero_signal: true,
        }
    }

    /// Degraded fallback: pure concatenation, nothing splits.
    pub fn concat() -> Self {
        Self {
            on_gap: false,
            on_zero_signal: false,
        }
    }
}

/// Chain overlapping fragments into layers under `policy`.
///
/// Fragments without labels cannot chain or emit points; they end the
/// current chain and are dropped with a warning.
pub fn layer_fragments(fragments: &[Fragment], policy: SplitPolicy) -> Vec<Layer> {
    let mut layers = Vec::new();
    let mut chain: Vec<&Fragment> = Vec::new();

    for fragment in fragments {
        if fragment.labels.is_empty() {
            warn!(r_id = fragment.r_id, "fragment without labels; dropped");
            if !chain.is_empty() {
                layers.push(stitch_chain(&chain));
                chain.clear();
            }
            continue;
        }
        if let Some(prev) = chain.last() {
            if should_split(prev, fragment, policy) {
                layers.push(stitch_chain(&chain));
                chain.clear();
            }
        }
        chain.push(fragment);
    }
    if !chain.is_empty() {
        layers.push(stitch_chain(&chain));
    }
    layers
}

fn should_split(prev: &Fragment, next: &Fragment, policy: SplitPolicy) -> bool {
    let overlap: Vec<(usize, usize)> = prev
        .labels
        .iter()
        .enumerate()
        .filter_map(|(i, label)| {
            next.labels
                .iter()
                .position(|other| other == label)
                .map(|j| (i, j))
        })
        .collect();

    if overlap.is_empty() {
        return policy.on_gap;
    }
    if policy.on_zero_signal {
        let max_prev = overlap
            .iter()
            .map(|(i, _)| prev.values[*i])
            .fold(f64::MIN, f64::max);
        let max_next = overlap
            .iter()
            .map(|(_, j)| next.values[*j])
            .fold(f64::MIN, f64::max);
        if max_prev <= 0.0 || max_next <= 0.0 {
            return true;
        }
    }
    false
}

fn stitch_chain(chain: &[&Fragment]) -> Layer {
    let mut series: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();
    for (label, value) in chain[0].labels.iter().zip(&chain[0].values) {
        series.insert(*label, *value);
    }

    for fragment in &chain[1..] {
        let overlap: Vec<(f64, f64)> = fragment
            .labels
            .iter()
            .zip(&fragment.values)
            .filter_map(|(label, value)| series.get(label).map(|have| (*have, *value)))
            .collect();

        let scale = if overlap.is_empty() {
            1.0
        } else {
            let max_have = overlap.iter().map(|(have, _)| *have).fold(f64::MIN, f64::max);
            let max_new = overlap.iter().map(|(_, new)| *new).fold(f64::MIN, f64::max);
            if max_have > 0.0 && max_new > 0.0 {
                max_have / max_new
            } else {
                1.0
            }
        };

        for (label, value) in fragment.labels.iter().zip(&fragment.values) {
            series.entry(*label).or_insert(value * scale);
        }
    }

    Layer {
        points: series.into_iter().collect(),
    }
}
