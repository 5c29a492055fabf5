//! Serde model of the fetcher subprocess output.
//!
//! A successful fetch prints one UTF-8 JSON document with three sections:
//! `time` (label → sample), `geo` (scope → location code → `[name, value]`)
//! and `related` (query and topic recommendation lists, each split into
//! `top` and `rising`). A structured upstream failure (exit code 5) prints
//! an `{"error": {"code", "msg"}}` envelope instead.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

/// `[display name, value]` pair under a geo scope.
pub type GeoEntry = (String, i64);

/// `[query, value]` recommendation.
pub type QueryRec = (String, i64);

/// `[topic id, title, topic name, value]` recommendation.
pub type TopicRec = (String, String, String, i64);

/// A label key that is not an ISO timestamp.
#[derive(Debug, thiserror::Error)]
#[error("unparseable time label {label:?}")]
pub struct BadTimeLabel {
    /// The offending key as it appeared in the payload.
    pub label: String,
}

/// Parsed fetcher payload.
#[derive(Debug, Deserialize)]
pub struct RawPayload {
    /// Sample map keyed by the service's own ISO labels.
    #[serde(default)]
    pub time: BTreeMap<String, i64>,
    /// Per-scope location values.
    #[serde(default)]
    pub geo: BTreeMap<String, BTreeMap<String, GeoEntry>>,
    /// Recommended queries and topics.
    #[serde(default)]
    pub related: RelatedSection,
}

/// The `related` section of a payload.
#[derive(Debug, Default, Deserialize)]
pub struct RelatedSection {
    /// Plain query recommendations.
    #[serde(default)]
    pub query: RelatedGroup<QueryRec>,
    /// Topic recommendations.
    #[serde(default)]
    pub topic: RelatedGroup<TopicRec>,
}

/// One `top`/`rising` pair of recommendation lists.
#[derive(Debug, Deserialize)]
pub struct RelatedGroup<T> {
    /// Highest-valued recommendations.
    #[serde(default)]
    pub top: Vec<T>,
    /// Fastest-growing recommendations.
    #[serde(default)]
    pub rising: Vec<T>,
}

impl<T> Default for RelatedGroup<T> {
    fn default() -> Self {
        Self {
            top: Vec::new(),
            rising: Vec::new(),
        }
    }
}

impl RawPayload {
    /// Parse a raw fetcher payload.
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// The payload's own `(label, sample)` pairs in chronological order.
    pub fn time_points(&self) -> Result<Vec<(DateTime<Utc>, i64)>, BadTimeLabel> {
        let mut points = Vec::with_capacity(self.time.len());
        for (label, value) in &self.time {
            points.push((parse_time_label(label)?, *value));
        }
        points.sort_by_key(|(at, _)| *at);
        Ok(points)
    }
}

/// The error envelope printed by fetch scripts on exit code 5.
#[derive(Debug, Deserialize)]
pub struct ErrorEnvelope {
    /// The upstream error.
    pub error: UpstreamError,
}

/// A structured error relayed from the trend service.
#[derive(Debug, Deserialize)]
pub struct UpstreamError {
    /// Upstream status code (e.g. 500 for a transient server error).
    pub code: i64,
    /// Upstream message.
    pub msg: String,
}

fn parse_time_label(label: &str) -> Result<DateTime<Utc>, BadTimeLabel> {
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(label, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(BadTimeLabel {
        label: label.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "time": {"2022-01-01T01:00:00": 20, "2022-01-01T00:00:00": 10},
        "geo": {
            "country": {"US": ["United States", 100]},
            "states": {"US-CA": ["California", 88]},
            "dma": {"807": ["San Francisco-Oakland-San Jose CA", 92]}
        },
        "related": {
            "query": {"top": [["solar panels", 100]], "rising": [["heat pump", 250]]},
            "topic": {"top": [["/m/0k1h", "Solar energy", "Topic", 100]], "rising": []}
        }
    }"#;

    #[test]
    fn full_payload_parses() {
        let payload = RawPayload::parse(FULL).unwrap();
        assert_eq!(payload.time.len(), 2);
        assert_eq!(payload.geo["country"]["US"], ("United States".into(), 100));
        assert_eq!(payload.related.query.top[0].0, "solar panels");
        assert_eq!(payload.related.topic.top[0].2, "Topic");
    }

    #[test]
    fn time_points_come_out_chronological() {
        let payload = RawPayload::parse(FULL).unwrap();
        let points = payload.time_points().unwrap();
        assert_eq!(points.len(), 2);
        assert!(points[0].0 < points[1].0);
        assert_eq!(points[0].1, 10);
        assert_eq!(points[1].1, 20);
    }

    #[test]
    fn space_separated_labels_parse_too() {
        let payload = RawPayload::parse(r#"{"time": {"2022-01-01 06:00:00": 3}}"#).unwrap();
        assert_eq!(payload.time_points().unwrap().len(), 1);
    }

    #[test]
    fn junk_labels_are_reported() {
        let payload = RawPayload::parse(r#"{"time": {"yesterday": 3}}"#).unwrap();
        assert!(payload.time_points().is_err());
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let payload = RawPayload::parse("{}").unwrap();
        assert!(payload.time.is_empty());
        assert!(payload.geo.is_empty());
        assert!(payload.related.query.top.is_empty());
    }

    #[test]
    fn error_envelope_parses() {
        let env: ErrorEnvelope =
            serde_json::from_str(r#"{"error": {"code": 500, "msg": "backend unavailable"}}"#)
                .unwrap();
        assert_eq!(env.error.code, 500);
        assert_eq!(env.error.msg, "backend unavailable");
    }
}
