//! The ingestion pipeline.
//!
//! A fetched payload is staged durably before anything parses it; the
//! structured write then happens in one transaction and retires the staging
//! row. Payloads that fail parsing or label validation keep their staging
//! row and their `running` request untouched, for manual repair or a later
//! replay.

use chrono::{DateTime, Utc};

use trendmill_core::labels::{reconstruct_labels, resolution_of};
use trendmill_core::model::{GeoScope, Request, StagedRow};
use trendmill_core::payload::RawPayload;
use trendmill_core::store::{
    GeoWrite, RelatedKind, RelatedWrite, Store, StructuredPayload,
};
use trendmill_core::window::Resolution;

/// What happened to one staged payload.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Structured records landed and the staging row is gone.
    Ingested {
        /// Detected sampling cadence, when supported.
        resolution: Option<Resolution>,
    },
    /// The payload could not be validated; staging row and `running` status
    /// were left in place.
    LeftForRepair {
        /// Human-readable reason.
        reason: String,
    },
}

/// Run steps B-E of the pipeline for one already-staged payload.
///
/// Store-level failures (uniqueness violations included) propagate as
/// errors: they are structured bugs, not payload problems.
pub fn ingest_staged(
    store: &mut Store,
    staged: &StagedRow,
    now: DateTime<Utc>,
) -> anyhow::Result<IngestOutcome> {
    let request = store.request(staged.r_id)?;

    let payload = match RawPayload::parse(&staged.raw) {
        Ok(payload) => payload,
        Err(err) => {
            return Ok(IngestOutcome::LeftForRepair {
                reason: format!("payload is not valid JSON: {err}"),
            });
        }
    };

    let points = match payload.time_points() {
        Ok(points) => points,
        Err(err) => {
            return Ok(IngestOutcome::LeftForRepair {
                reason: err.to_string(),
            });
        }
    };

    let labels = match reconstruct_labels(request.window, points.len()) {
        Ok(labels) => labels,
        Err(err) => {
            return Ok(IngestOutcome::LeftForRepair {
                reason: err.to_string(),
            });
        }
    };
    if labels
        .iter()
        .zip(points.iter())
        .any(|(expected, (actual, _))| expected != actual)
    {
        return Ok(IngestOutcome::LeftForRepair {
            reason: "payload labels disagree with the reconstructed sequence".to_string(),
        });
    }

    let structured = match build_structured(&request, &payload, &points, &labels) {
        Ok(structured) => structured,
        Err(reason) => return Ok(IngestOutcome::LeftForRepair { reason }),
    };
    let resolution = resolution_of(&labels);

    store.ingest_structured(staged, &structured, now.timestamp())?;
    Ok(IngestOutcome::Ingested { resolution })
}

fn build_structured(
    request: &Request,
    payload: &RawPayload,
    points: &[(DateTime<Utc>, i64)],
    labels: &[DateTime<Utc>],
) -> Result<StructuredPayload, String> {
    let samples = points.iter().map(|(_, value)| *value).collect();

    // The service returns identical data under `region` and `states` for
    // US-scoped requests; keeping both would break the (request, location,
    // keyword) uniqueness constraint.
    let suppress_region = request.geo.as_deref() == Some("US");

    let mut geo = Vec::new();
    for (scope_key, entries) in &payload.geo {
        let Some(scope) = GeoScope::parse(scope_key) else {
            return Err(format!("unknown geo scope {scope_key:?}"));
        };
        if scope == GeoScope::Region && suppress_region {
            continue;
        }
        for (code, (name, value)) in entries {
            geo.push(GeoWrite {
                scope,
                code: code.clone(),
                name: name.clone(),
                value: *value,
            });
        }
    }

    let mut related = Vec::new();
    for (rising, recs) in [
        (false, &payload.related.query.top),
        (true, &payload.related.query.rising),
    ] {
        for (term, value) in recs {
            related.push(RelatedWrite {
                rising,
                value: *value,
                kind: RelatedKind::Query { term: term.clone() },
            });
        }
    }
    for (rising, recs) in [
        (false, &payload.related.topic.top),
        (true, &payload.related.topic.rising),
    ] {
        for (id, title, topic, value) in recs {
            related.push(RelatedWrite {
                rising,
                value: *value,
                kind: RelatedKind::Topic {
                    id: id.clone(),
                    title: title.clone(),
                    topic: topic.clone(),
                },
            });
        }
    }

    Ok(StructuredPayload {
        samples,
        geo,
        related,
        resolution_tag: resolution_of(labels).and_then(Resolution::tag),
    })
}
