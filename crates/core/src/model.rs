//! Row-level types shared between the store, the dispatcher and the
//! stitching engine.

use crate::window::TimeWindow;

/// Lifecycle states of a queued request.
///
/// Created `Open` by the external queuer; `Running` while a dispatcher owns
/// it; `Done` once structured records landed; `Error` only through
/// out-of-band administrative repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Waiting to be claimed.
    Open,
    /// Claimed by a dispatcher.
    Running,
    /// Fully ingested.
    Done,
    /// Parked by an operator.
    Error,
}

impl RequestStatus {
    /// Stable row id in the `request_status` lookup table.
    pub fn id(self) -> i64 {
        match self {
            RequestStatus::Open => 1,
            RequestStatus::Running => 2,
            RequestStatus::Done => 3,
            RequestStatus::Error => 4,
        }
    }

    /// Lookup-table name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Open => "open",
            RequestStatus::Running => "running",
            RequestStatus::Done => "done",
            RequestStatus::Error => "error",
        }
    }

    /// Inverse of [`RequestStatus::id`].
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(RequestStatus::Open),
            2 => Some(RequestStatus::Running),
            3 => Some(RequestStatus::Done),
            4 => Some(RequestStatus::Error),
            _ => None,
        }
    }
}

/// Geographic granularity of a geo value row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoScope {
    /// Whole-country value.
    Country,
    /// First-level subdivisions.
    States,
    /// Service-specific regions.
    Region,
    /// US designated market areas.
    Dma,
}

impl GeoScope {
    /// Wire and column representation of this scope.
    pub fn as_str(self) -> &'static str {
        match self {
            GeoScope::Country => "country",
            GeoScope::States => "states",
            GeoScope::Region => "region",
            GeoScope::Dma => "dma",
        }
    }

    /// Parse a payload scope key.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "country" => Some(GeoScope::Country),
            "states" => Some(GeoScope::States),
            "region" => Some(GeoScope::Region),
            "dma" => Some(GeoScope::Dma),
            _ => None,
        }
    }
}

/// A queued request row.
#[derive(Debug, Clone)]
pub struct Request {
    /// Primary key.
    pub r_id: i64,
    /// Who queued the request.
    pub submitter: String,
    /// Queue insertion time, unix seconds.
    pub submitted_at: i64,
    /// Upstream API flavor to fetch with.
    pub api_flavor: String,
    /// Claim priority; higher claims first.
    pub priority: i64,
    /// Optional geo restriction (e.g. `US`); `None` means worldwide.
    pub geo: Option<String>,
    /// The sampling window.
    pub window: TimeWindow,
    /// Current lifecycle state.
    pub status: RequestStatus,
    /// Earliest eligible dispatch time, unix seconds.
    pub not_before: i64,
    /// Latest eligible dispatch time, unix seconds.
    pub not_after: i64,
    /// Ingestion completion time, unix seconds.
    pub completed_at: Option<i64>,
    /// The fetcher that served the request.
    pub f_id: Option<i64>,
    /// Free-form operator note.
    pub note: Option<String>,
}

/// Fields the queuer provides when inserting a request.
#[derive(Debug, Clone)]
pub struct NewRequest {
    /// Who is queueing.
    pub submitter: String,
    /// Upstream API flavor.
    pub api_flavor: String,
    /// Claim priority; higher claims first.
    pub priority: i64,
    /// Optional geo restriction.
    pub geo: Option<String>,
    /// The sampling window.
    pub window: TimeWindow,
    /// Earliest eligible dispatch time, unix seconds.
    pub not_before: i64,
    /// Latest eligible dispatch time, unix seconds.
    pub not_after: i64,
    /// Free-form note.
    pub note: Option<String>,
}

/// A request a dispatcher just locked, joined with its keyword.
#[derive(Debug, Clone)]
pub struct ClaimedRequest {
    /// The locked request.
    pub request: Request,
    /// Keyword id attached to the request.
    pub k_id: i64,
    /// Keyword term (query string or topic id) to fetch.
    pub keyword: String,
}

/// Outcome of one claim attempt.
#[derive(Debug)]
pub enum Claim {
    /// Nothing is eligible right now.
    Empty,
    /// The advisory candidate was locked by another dispatcher first.
    Raced,
    /// A request was locked.
    Claimed(ClaimedRequest),
}

/// A staged raw payload awaiting ingestion.
#[derive(Debug, Clone)]
pub struct StagedRow {
    /// Primary key of the staging row.
    pub rfo_id: i64,
    /// Raw UTF-8 payload text.
    pub raw: String,
    /// The fetcher that produced the payload.
    pub f_id: i64,
    /// The request the payload answers.
    pub r_id: i64,
    /// The keyword the payload is about.
    pub k_id: i64,
    /// Fetch instant, unix seconds. Preserved through recovery so the
    /// eventual time-series row carries the true fetch time.
    pub fetched_at: i64,
}

/// A completed request's time-series output, as read back for stitching.
#[derive(Debug, Clone)]
pub struct FragmentRow {
    /// The originating request.
    pub r_id: i64,
    /// The request's sampling window.
    pub window: TimeWindow,
    /// Stored sample vector.
    pub samples: Vec<i64>,
}
