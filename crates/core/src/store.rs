//! The relational store.
//!
//! All request state transitions go through this layer. The handle owns one
//! SQLite connection; multiple dispatcher processes may each open their own
//! handle on the same database file, with correctness resting on the
//! conditional `UPDATE ... WHERE status = open RETURNING` claim that SQLite
//! serializes.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::Duration;

use crate::model::{
    Claim, ClaimedRequest, FragmentRow, GeoScope, NewRequest, Request, RequestStatus, StagedRow,
};
use crate::window::TimeWindow;

/// The service only materializes completed windows; a window must have ended
/// at least this long ago before its request becomes claimable.
const WINDOW_SETTLE_SECS: i64 = 600;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS request_status (
    rs_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
INSERT OR IGNORE INTO request_status (rs_id, name)
VALUES (1, 'open'), (2, 'running'), (3, 'done'), (4, 'error');

CREATE TABLE IF NOT EXISTS fetchers (
    f_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    host TEXT NOT NULL,
    api_flavor TEXT NOT NULL,
    UNIQUE (name, host, api_flavor)
);

CREATE TABLE IF NOT EXISTS requests (
    r_id INTEGER PRIMARY KEY,
    submitter TEXT NOT NULL,
    submitted_at INTEGER NOT NULL,
    api_flavor TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    geo TEXT,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    status_id INTEGER NOT NULL DEFAULT 1 REFERENCES request_status (rs_id),
    not_before INTEGER NOT NULL,
    not_after INTEGER NOT NULL,
    completed_at INTEGER,
    f_id INTEGER REFERENCES fetchers (f_id),
    note TEXT,
    CHECK (window_start < window_end)
);

CREATE TABLE IF NOT EXISTS topics (
    t_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS keywords (
    k_id INTEGER PRIMARY KEY,
    term TEXT NOT NULL UNIQUE,
    title TEXT,
    topic_id INTEGER REFERENCES topics (t_id),
    inserted_at INTEGER NOT NULL,
    CHECK ((title IS NULL) = (topic_id IS NULL))
);

CREATE TABLE IF NOT EXISTS keywords_in_request (
    r_id INTEGER NOT NULL REFERENCES requests (r_id),
    k_id INTEGER NOT NULL REFERENCES keywords (k_id),
    UNIQUE (r_id, k_id)
);

CREATE TABLE IF NOT EXISTS locations (
    l_id INTEGER PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS time_series (
    ts_id INTEGER PRIMARY KEY,
    r_id INTEGER NOT NULL REFERENCES requests (r_id),
    k_id INTEGER NOT NULL REFERENCES keywords (k_id),
    samples TEXT NOT NULL,
    fetched_at INTEGER NOT NULL,
    UNIQUE (r_id, k_id)
);

CREATE TABLE IF NOT EXISTS geo_values (
    g_id INTEGER PRIMARY KEY,
    r_id INTEGER NOT NULL REFERENCES requests (r_id),
    l_id INTEGER NOT NULL REFERENCES locations (l_id),
    k_id INTEGER NOT NULL REFERENCES keywords (k_id),
    scope TEXT NOT NULL,
    value INTEGER NOT NULL,
    UNIQUE (r_id, l_id, k_id)
);

CREATE TABLE IF NOT EXISTS related_keywords (
    rk_id INTEGER PRIMARY KEY,
    r_id INTEGER NOT NULL REFERENCES requests (r_id),
    source_k_id INTEGER NOT NULL REFERENCES keywords (k_id),
    recommended_k_id INTEGER NOT NULL REFERENCES keywords (k_id),
    rising INTEGER NOT NULL,
    value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_fetcher_output (
    rfo_id INTEGER PRIMARY KEY,
    raw TEXT NOT NULL,
    f_id INTEGER NOT NULL REFERENCES fetchers (f_id),
    r_id INTEGER NOT NULL REFERENCES requests (r_id),
    k_id INTEGER NOT NULL REFERENCES keywords (k_id),
    rfo_ts INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS request_tags (
    r_id INTEGER NOT NULL REFERENCES requests (r_id),
    tag TEXT NOT NULL,
    UNIQUE (r_id, tag)
);
"#;

/// Store-level failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure, including constraint violations.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    /// A stored window no longer satisfies `start < end`.
    #[error("request {r_id} holds a corrupt window")]
    CorruptWindow {
        /// The offending request.
        r_id: i64,
    },
    /// A stored sample vector is not a JSON integer array.
    #[error("request {r_id} holds a corrupt sample vector: {source}")]
    CorruptSamples {
        /// The offending request.
        r_id: i64,
        /// Decode failure.
        source: serde_json::Error,
    },
    /// A state transition found the request in an unexpected state.
    #[error("request {r_id} was not '{expected}' during {op}")]
    StateMismatch {
        /// The offending request.
        r_id: i64,
        /// The state the operation required.
        expected: &'static str,
        /// The operation that tripped.
        op: &'static str,
    },
    /// A referenced request does not exist.
    #[error("request {r_id} not found")]
    MissingRequest {
        /// The missing id.
        r_id: i64,
    },
}

/// A fully parsed and validated payload, ready for the structured write.
#[derive(Debug)]
pub struct StructuredPayload {
    /// Sample vector in label order.
    pub samples: Vec<i64>,
    /// Geo value rows to insert (locations interned on the fly).
    pub geo: Vec<GeoWrite>,
    /// Related-keyword rows to insert (keywords/topics interned on the fly).
    pub related: Vec<RelatedWrite>,
    /// Resolution tag derived from the reconstructed labels, if any.
    pub resolution_tag: Option<&'static str>,
}

/// One geo value to write.
#[derive(Debug)]
pub struct GeoWrite {
    /// Geographic granularity.
    pub scope: GeoScope,
    /// Location code (ISO or service-specific).
    pub code: String,
    /// Location display name.
    pub name: String,
    /// Scaled interest value.
    pub value: i64,
}

/// One related-keyword recommendation to write.
#[derive(Debug)]
pub struct RelatedWrite {
    /// False for `top` recommendations, true for `rising`.
    pub rising: bool,
    /// Recommendation value.
    pub value: i64,
    /// What is being recommended.
    pub kind: RelatedKind,
}

/// The two shapes a recommendation arrives in.
#[derive(Debug)]
pub enum RelatedKind {
    /// A plain query string.
    Query {
        /// The recommended query.
        term: String,
    },
    /// A topic with display metadata.
    Topic {
        /// Service topic id.
        id: String,
        /// Display title.
        title: String,
        /// Topic kind name, interned lazily.
        topic: String,
    },
}

/// Handle on the relational store.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (and bootstrap, if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database. Test isolation only.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Insert a request in state `open`. Shared by the external queuer,
    /// operators and tests.
    pub fn insert_request(&self, req: &NewRequest) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO requests
                 (submitter, submitted_at, api_flavor, priority, geo,
                  window_start, window_end, status_id, not_before, not_after, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                req.submitter,
                Utc::now().timestamp(),
                req.api_flavor,
                req.priority,
                req.geo,
                req.window.start.timestamp(),
                req.window.end.timestamp(),
                RequestStatus::Open.id(),
                req.not_before,
                req.not_after,
                req.note,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Intern a keyword, returning its id. Topic keywords carry a title and
    /// a lazily interned topic name; plain queries carry neither.
    pub fn intern_keyword(
        &self,
        term: &str,
        topic_meta: Option<(&str, &str)>,
    ) -> Result<i64, StoreError> {
        intern_keyword(&self.conn, term, topic_meta)
    }

    /// Attach a keyword to a request.
    pub fn attach_keyword(&self, r_id: i64, k_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO keywords_in_request (r_id, k_id) VALUES (?1, ?2)",
            params![r_id, k_id],
        )?;
        Ok(())
    }

    /// Intern a fetcher identity for provenance, returning its id.
    pub fn intern_fetcher(
        &self,
        name: &str,
        host: &str,
        api_flavor: &str,
    ) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO fetchers (name, host, api_flavor) VALUES (?1, ?2, ?3)",
            params![name, host, api_flavor],
        )?;
        Ok(self.conn.query_row(
            "SELECT f_id FROM fetchers WHERE name = ?1 AND host = ?2 AND api_flavor = ?3",
            params![name, host, api_flavor],
            |row| row.get(0),
        )?)
    }

    /// Claim the next eligible request: the advisory highest-priority
    /// candidate, then an atomic conditional lock on it. A lost race shows
    /// up as [`Claim::Raced`] and costs nothing.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Claim, StoreError> {
        let now_s = now.timestamp();
        let settled_before = now_s - WINDOW_SETTLE_SECS;

        let candidate: Option<i64> = self
            .conn
            .query_row(
                "SELECT r.r_id FROM requests r
                 JOIN keywords_in_request kr ON kr.r_id = r.r_id
                 WHERE r.status_id = ?1
                   AND r.not_before < ?2
                   AND r.not_after > ?2
                   AND r.window_end < ?3
                   AND r.r_id NOT IN (SELECT r_id FROM raw_fetcher_output)
                 ORDER BY r.priority DESC, r.not_after ASC
                 LIMIT 1",
                params![RequestStatus::Open.id(), now_s, settled_before],
                |row| row.get(0),
            )
            .optional()?;

        let Some(r_id) = candidate else {
            return Ok(Claim::Empty);
        };
        if !self.try_lock(r_id)? {
            return Ok(Claim::Raced);
        }

        let request = self.request(r_id)?;
        let (k_id, keyword) = self.conn.query_row(
            "SELECT k.k_id, k.term FROM keywords_in_request kr
             JOIN keywords k ON k.k_id = kr.k_id
             WHERE kr.r_id = ?1
             ORDER BY k.k_id
             LIMIT 1",
            params![r_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(Claim::Claimed(ClaimedRequest {
            request,
            k_id,
            keyword,
        }))
    }

    /// Atomically lock one `open` request. Returns false when another
    /// dispatcher got there first.
    pub fn try_lock(&self, r_id: i64) -> Result<bool, StoreError> {
        let locked: Option<i64> = self
            .conn
            .query_row(
                "UPDATE requests SET status_id = ?1
                 WHERE r_id = ?2 AND status_id = ?3
                 RETURNING r_id",
                params![
                    RequestStatus::Running.id(),
                    r_id,
                    RequestStatus::Open.id()
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(locked.is_some())
    }

    /// Revert a `running` request to `open`. Returns false when the request
    /// was not running (already repaired or completed elsewhere).
    pub fn release_request(&self, r_id: i64) -> Result<bool, StoreError> {
        let reverted = self.conn.execute(
            "UPDATE requests SET status_id = ?1 WHERE r_id = ?2 AND status_id = ?3",
            params![RequestStatus::Open.id(), r_id, RequestStatus::Running.id()],
        )?;
        Ok(reverted == 1)
    }

    /// Durably stage a raw payload before any parsing touches it. Committed
    /// on return; this row is the write-ahead record that survives crashes
    /// and ingestion bugs.
    pub fn stage_raw(
        &self,
        r_id: i64,
        k_id: i64,
        f_id: i64,
        raw: &str,
        fetched_at: i64,
    ) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO raw_fetcher_output (raw, f_id, r_id, k_id, rfo_ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![raw, f_id, r_id, k_id, fetched_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All staged payloads, oldest first.
    pub fn staged_rows(&self) -> Result<Vec<StagedRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT rfo_id, raw, f_id, r_id, k_id, rfo_ts
             FROM raw_fetcher_output ORDER BY rfo_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StagedRow {
                rfo_id: row.get(0)?,
                raw: row.get(1)?,
                f_id: row.get(2)?,
                r_id: row.get(3)?,
                k_id: row.get(4)?,
                fetched_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Load one request row.
    pub fn request(&self, r_id: i64) -> Result<Request, StoreError> {
        let raw = self
            .conn
            .query_row(
                "SELECT r_id, submitter, submitted_at, api_flavor, priority, geo,
                        window_start, window_end, status_id, not_before, not_after,
                        completed_at, f_id, note
                 FROM requests WHERE r_id = ?1",
                params![r_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, i64>(9)?,
                        row.get::<_, i64>(10)?,
                        row.get::<_, Option<i64>>(11)?,
                        row.get::<_, Option<i64>>(12)?,
                        row.get::<_, Option<String>>(13)?,
                    ))
                },
            )
            .optional()?
            .ok_or(StoreError::MissingRequest { r_id })?;

        let window = TimeWindow::from_unix(raw.6, raw.7)
            .ok_or(StoreError::CorruptWindow { r_id })?;
        let status =
            RequestStatus::from_id(raw.8).ok_or(StoreError::CorruptWindow { r_id })?;
        Ok(Request {
            r_id: raw.0,
            submitter: raw.1,
            submitted_at: raw.2,
            api_flavor: raw.3,
            priority: raw.4,
            geo: raw.5,
            window,
            status,
            not_before: raw.9,
            not_after: raw.10,
            completed_at: raw.11,
            f_id: raw.12,
            note: raw.13,
        })
    }

    /// Current status of a request.
    pub fn status_of(&self, r_id: i64) -> Result<RequestStatus, StoreError> {
        Ok(self.request(r_id)?.status)
    }

    /// Write all structured records for one staged payload and retire the
    /// staging row, as a single transaction: time-series row, geo rows,
    /// related-keyword rows, the `running → done` flip (asserted to touch
    /// exactly one row) and the staging delete.
    pub fn ingest_structured(
        &mut self,
        staged: &StagedRow,
        payload: &StructuredPayload,
        completed_at: i64,
    ) -> Result<(), StoreError> {
        let samples = serde_json::to_string(&payload.samples).map_err(|source| {
            StoreError::CorruptSamples {
                r_id: staged.r_id,
                source,
            }
        })?;

        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO time_series (r_id, k_id, samples, fetched_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![staged.r_id, staged.k_id, samples, staged.fetched_at],
        )?;

        for geo in &payload.geo {
            let l_id = intern_location(&tx, &geo.code, &geo.name)?;
            tx.execute(
                "INSERT INTO geo_values (r_id, l_id, k_id, scope, value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![staged.r_id, l_id, staged.k_id, geo.scope.as_str(), geo.value],
            )?;
        }

        for rel in &payload.related {
            let recommended = match &rel.kind {
                RelatedKind::Query { term } => intern_keyword(&tx, term, None)?,
                RelatedKind::Topic { id, title, topic } => {
                    intern_keyword(&tx, id, Some((title, topic)))?
                }
            };
            tx.execute(
                "INSERT INTO related_keywords (r_id, source_k_id, recommended_k_id, rising, value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![staged.r_id, staged.k_id, recommended, rel.rising, rel.value],
            )?;
        }

        let flipped = tx.execute(
            "UPDATE requests SET status_id = ?1, completed_at = ?2, f_id = ?3
             WHERE r_id = ?4 AND status_id = ?5",
            params![
                RequestStatus::Done.id(),
                completed_at,
                staged.f_id,
                staged.r_id,
                RequestStatus::Running.id()
            ],
        )?;
        if flipped != 1 {
            return Err(StoreError::StateMismatch {
                r_id: staged.r_id,
                expected: "running",
                op: "ingest",
            });
        }

        tx.execute(
            "DELETE FROM raw_fetcher_output WHERE rfo_id = ?1",
            params![staged.rfo_id],
        )?;
        if let Some(tag) = payload.resolution_tag {
            tx.execute(
                "INSERT OR IGNORE INTO request_tags (r_id, tag) VALUES (?1, ?2)",
                params![staged.r_id, tag],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Tags attached to a request.
    pub fn tags_of(&self, r_id: i64) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT tag FROM request_tags WHERE r_id = ?1 ORDER BY tag")?;
        let rows = stmt.query_map(params![r_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Completed fragments of a keyword under one resolution tag and one geo
    /// (`None` = worldwide), ordered by window start.
    pub fn fragments(
        &self,
        k_id: i64,
        geo: Option<&str>,
        resolution_tag: &str,
    ) -> Result<Vec<FragmentRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT ts.r_id, r.window_start, r.window_end, ts.samples
             FROM time_series ts
             JOIN requests r ON r.r_id = ts.r_id
             JOIN request_tags t ON t.r_id = ts.r_id AND t.tag = ?1
             WHERE ts.k_id = ?2 AND r.status_id = ?3 AND r.geo IS ?4
             ORDER BY r.window_start, r.window_end",
        )?;
        let rows = stmt.query_map(
            params![resolution_tag, k_id, RequestStatus::Done.id(), geo],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )?;

        let mut fragments = Vec::new();
        for row in rows {
            let (r_id, start, end, samples) = row?;
            let window =
                TimeWindow::from_unix(start, end).ok_or(StoreError::CorruptWindow { r_id })?;
            let samples = serde_json::from_str(&samples)
                .map_err(|source| StoreError::CorruptSamples { r_id, source })?;
            fragments.push(FragmentRow {
                r_id,
                window,
                samples,
            });
        }
        Ok(fragments)
    }

    /// Distinct geos among a keyword's completed requests.
    pub fn geos_for_keyword(&self, k_id: i64) -> Result<Vec<Option<String>>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT r.geo FROM requests r
             JOIN time_series ts ON ts.r_id = r.r_id
             WHERE ts.k_id = ?1 AND r.status_id = ?2
             ORDER BY r.geo",
        )?;
        let rows = stmt.query_map(params![k_id, RequestStatus::Done.id()], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// The stored sample vector for `(request, keyword)`, if any.
    pub fn time_series_for(&self, r_id: i64, k_id: i64) -> Result<Option<Vec<i64>>, StoreError> {
        let samples: Option<String> = self
            .conn
            .query_row(
                "SELECT samples FROM time_series WHERE r_id = ?1 AND k_id = ?2",
                params![r_id, k_id],
                |row| row.get(0),
            )
            .optional()?;
        samples
            .map(|s| {
                serde_json::from_str(&s)
                    .map_err(|source| StoreError::CorruptSamples { r_id, source })
            })
            .transpose()
    }

    /// `(scope, location code, value)` rows of a request.
    pub fn geo_values_for(&self, r_id: i64) -> Result<Vec<(String, String, i64)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT g.scope, l.code, g.value FROM geo_values g
             JOIN locations l ON l.l_id = g.l_id
             WHERE g.r_id = ?1 ORDER BY g.scope, l.code",
        )?;
        let rows = stmt.query_map(params![r_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// `(recommended term, rising, value)` rows of a request.
    pub fn related_for(&self, r_id: i64) -> Result<Vec<(String, bool, i64)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT k.term, rk.rising, rk.value FROM related_keywords rk
             JOIN keywords k ON k.k_id = rk.recommended_k_id
             WHERE rk.r_id = ?1 ORDER BY rk.rk_id",
        )?;
        let rows = stmt.query_map(params![r_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

fn intern_keyword(
    conn: &Connection,
    term: &str,
    topic_meta: Option<(&str, &str)>,
) -> Result<i64, StoreError> {
    match topic_meta {
        None => {
            conn.execute(
                "INSERT OR IGNORE INTO keywords (term, inserted_at) VALUES (?1, ?2)",
                params![term, Utc::now().timestamp()],
            )?;
        }
        Some((title, topic)) => {
            let t_id = intern_topic(conn, topic)?;
            conn.execute(
                "INSERT OR IGNORE INTO keywords (term, title, topic_id, inserted_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![term, title, t_id, Utc::now().timestamp()],
            )?;
        }
    }
    Ok(conn.query_row(
        "SELECT k_id FROM keywords WHERE term = ?1",
        params![term],
        |row| row.get(0),
    )?)
}

fn intern_topic(conn: &Connection, name: &str) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO topics (name) VALUES (?1)",
        params![name],
    )?;
    Ok(conn.query_row(
        "SELECT t_id FROM topics WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?)
}

fn intern_location(conn: &Connection, code: &str, name: &str) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO locations (code, name) VALUES (?1, ?2)",
        params![code, name],
    )?;
    Ok(conn.query_row(
        "SELECT l_id FROM locations WHERE code = ?1",
        params![code],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 6, 1, 12, 0, 0).unwrap()
    }

    fn settled_window() -> TimeWindow {
        // Ended well over ten minutes before `now`.
        TimeWindow::from_unix(
            now().timestamp() - 86_400,
            now().timestamp() - 43_200,
        )
        .unwrap()
    }

    fn queue_request(store: &Store, priority: i64, not_after: i64) -> i64 {
        let r_id = store
            .insert_request(&NewRequest {
                submitter: "test".into(),
                api_flavor: "web".into(),
                priority,
                geo: Some("US".into()),
                window: settled_window(),
                not_before: now().timestamp() - 3_600,
                not_after,
                note: None,
            })
            .unwrap();
        let k_id = store.intern_keyword("solar", None).unwrap();
        store.attach_keyword(r_id, k_id).unwrap();
        r_id
    }

    #[test]
    fn claim_takes_highest_priority_then_nearest_deadline() {
        let store = Store::open_in_memory().unwrap();
        let deadline = now().timestamp() + 7_200;
        let low = queue_request(&store, 1, deadline);
        let high_late = queue_request(&store, 5, deadline + 100);
        let high_soon = queue_request(&store, 5, deadline);

        let Claim::Claimed(first) = store.claim_next(now()).unwrap() else {
            panic!("expected a claim");
        };
        assert_eq!(first.request.r_id, high_soon);
        assert_eq!(first.keyword, "solar");
        assert_eq!(first.request.status, RequestStatus::Running);

        let Claim::Claimed(second) = store.claim_next(now()).unwrap() else {
            panic!("expected a claim");
        };
        assert_eq!(second.request.r_id, high_late);

        let Claim::Claimed(third) = store.claim_next(now()).unwrap() else {
            panic!("expected a claim");
        };
        assert_eq!(third.request.r_id, low);

        assert!(matches!(store.claim_next(now()).unwrap(), Claim::Empty));
    }

    #[test]
    fn unsettled_windows_are_not_claimable() {
        let store = Store::open_in_memory().unwrap();
        let r_id = store
            .insert_request(&NewRequest {
                submitter: "test".into(),
                api_flavor: "web".into(),
                priority: 0,
                geo: None,
                // Ends five minutes before `now`, inside the settle margin.
                window: TimeWindow::from_unix(
                    now().timestamp() - 3_600,
                    now().timestamp() - 300,
                )
                .unwrap(),
                not_before: now().timestamp() - 3_600,
                not_after: now().timestamp() + 3_600,
                note: None,
            })
            .unwrap();
        let k_id = store.intern_keyword("solar", None).unwrap();
        store.attach_keyword(r_id, k_id).unwrap();

        assert!(matches!(store.claim_next(now()).unwrap(), Claim::Empty));
    }

    #[test]
    fn eligibility_window_is_honored() {
        let store = Store::open_in_memory().unwrap();
        // not_before in the future.
        let r_id = queue_request(&store, 0, now().timestamp() + 7_200);
        store
            .conn
            .execute(
                "UPDATE requests SET not_before = ?1 WHERE r_id = ?2",
                params![now().timestamp() + 60, r_id],
            )
            .unwrap();
        assert!(matches!(store.claim_next(now()).unwrap(), Claim::Empty));

        // not_after in the past.
        store
            .conn
            .execute(
                "UPDATE requests SET not_before = ?1, not_after = ?2 WHERE r_id = ?3",
                params![now().timestamp() - 3_600, now().timestamp() - 60, r_id],
            )
            .unwrap();
        assert!(matches!(store.claim_next(now()).unwrap(), Claim::Empty));
    }

    #[test]
    fn staged_requests_are_excluded_from_claims() {
        let store = Store::open_in_memory().unwrap();
        let r_id = queue_request(&store, 0, now().timestamp() + 7_200);
        let k_id = store.intern_keyword("solar", None).unwrap();
        let f_id = store.intern_fetcher("local", "localhost", "web").unwrap();
        assert!(store.try_lock(r_id).unwrap());
        store
            .stage_raw(r_id, k_id, f_id, "{}", now().timestamp())
            .unwrap();
        store.release_request(r_id).unwrap();

        assert!(matches!(store.claim_next(now()).unwrap(), Claim::Empty));
    }

    #[test]
    fn lock_is_atomic_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let a = Store::open(&path).unwrap();
        let b = Store::open(&path).unwrap();

        let r_id = queue_request(&a, 0, now().timestamp() + 7_200);
        assert!(a.try_lock(r_id).unwrap());
        assert!(!b.try_lock(r_id).unwrap());
        assert_eq!(a.status_of(r_id).unwrap(), RequestStatus::Running);
    }

    #[test]
    fn release_reverts_running_to_open_exactly_once() {
        let store = Store::open_in_memory().unwrap();
        let r_id = queue_request(&store, 0, now().timestamp() + 7_200);
        assert!(store.try_lock(r_id).unwrap());
        assert!(store.release_request(r_id).unwrap());
        assert!(!store.release_request(r_id).unwrap());
        assert_eq!(store.status_of(r_id).unwrap(), RequestStatus::Open);
    }

    #[test]
    fn ingest_writes_all_records_and_retires_staging() {
        let mut store = Store::open_in_memory().unwrap();
        let r_id = queue_request(&store, 0, now().timestamp() + 7_200);
        let k_id = store.intern_keyword("solar", None).unwrap();
        let f_id = store.intern_fetcher("local", "localhost", "web").unwrap();
        assert!(store.try_lock(r_id).unwrap());
        let rfo_id = store
            .stage_raw(r_id, k_id, f_id, "{}", now().timestamp() - 30)
            .unwrap();
        let staged = store.staged_rows().unwrap().pop().unwrap();
        assert_eq!(staged.rfo_id, rfo_id);
        assert_eq!(staged.fetched_at, now().timestamp() - 30);

        store
            .ingest_structured(
                &staged,
                &StructuredPayload {
                    samples: vec![1, 2, 3],
                    geo: vec![GeoWrite {
                        scope: GeoScope::States,
                        code: "US-CA".into(),
                        name: "California".into(),
                        value: 88,
                    }],
                    related: vec![
                        RelatedWrite {
                            rising: false,
                            value: 100,
                            kind: RelatedKind::Query {
                                term: "solar panels".into(),
                            },
                        },
                        RelatedWrite {
                            rising: true,
                            value: 250,
                            kind: RelatedKind::Topic {
                                id: "/m/0k1h".into(),
                                title: "Solar energy".into(),
                                topic: "Topic".into(),
                            },
                        },
                    ],
                    resolution_tag: Some("resolution:hourly"),
                },
                now().timestamp(),
            )
            .unwrap();

        assert_eq!(store.status_of(r_id).unwrap(), RequestStatus::Done);
        assert!(store.staged_rows().unwrap().is_empty());
        assert_eq!(
            store.time_series_for(r_id, k_id).unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(
            store.geo_values_for(r_id).unwrap(),
            vec![("states".into(), "US-CA".into(), 88)]
        );
        assert_eq!(
            store.related_for(r_id).unwrap(),
            vec![
                ("solar panels".into(), false, 100),
                ("/m/0k1h".into(), true, 250),
            ]
        );
        assert_eq!(
            store.tags_of(r_id).unwrap(),
            vec!["resolution:hourly".to_string()]
        );
        let done = store.request(r_id).unwrap();
        assert_eq!(done.completed_at, Some(now().timestamp()));
        assert_eq!(done.f_id, Some(f_id));
    }

    #[test]
    fn ingest_refuses_requests_that_are_not_running() {
        let mut store = Store::open_in_memory().unwrap();
        let r_id = queue_request(&store, 0, now().timestamp() + 7_200);
        let k_id = store.intern_keyword("solar", None).unwrap();
        let f_id = store.intern_fetcher("local", "localhost", "web").unwrap();
        assert!(store.try_lock(r_id).unwrap());
        store
            .stage_raw(r_id, k_id, f_id, "{}", now().timestamp())
            .unwrap();
        store.release_request(r_id).unwrap();
        let staged = store.staged_rows().unwrap().pop().unwrap();

        let err = store
            .ingest_structured(
                &staged,
                &StructuredPayload {
                    samples: vec![1],
                    geo: Vec::new(),
                    related: Vec::new(),
                    resolution_tag: None,
                },
                now().timestamp(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::StateMismatch { .. }));
        // The failed transaction must leave the staging row in place.
        assert_eq!(store.staged_rows().unwrap().len(), 1);
        assert_eq!(store.time_series_for(r_id, k_id).unwrap(), None);
    }

    #[test]
    fn fragments_filter_by_tag_and_geo() {
        let mut store = Store::open_in_memory().unwrap();
        let r_id = queue_request(&store, 0, now().timestamp() + 7_200);
        let k_id = store.intern_keyword("solar", None).unwrap();
        let f_id = store.intern_fetcher("local", "localhost", "web").unwrap();
        assert!(store.try_lock(r_id).unwrap());
        store
            .stage_raw(r_id, k_id, f_id, "{}", now().timestamp())
            .unwrap();
        let staged = store.staged_rows().unwrap().pop().unwrap();
        store
            .ingest_structured(
                &staged,
                &StructuredPayload {
                    samples: vec![4, 5, 6],
                    geo: Vec::new(),
                    related: Vec::new(),
                    resolution_tag: Some("resolution:hourly"),
                },
                now().timestamp(),
            )
            .unwrap();

        let frags = store
            .fragments(k_id, Some("US"), "resolution:hourly")
            .unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].r_id, r_id);
        assert_eq!(frags[0].samples, vec![4, 5, 6]);
        assert_eq!(frags[0].window, settled_window());

        assert!(store.fragments(k_id, None, "resolution:hourly").unwrap().is_empty());
        assert!(store.fragments(k_id, Some("US"), "resolution:daily").unwrap().is_empty());
        assert_eq!(store.geos_for_keyword(k_id).unwrap(), vec![Some("US".into())]);
    }
}
