//! The standalone analytics database the stitcher writes.

use std::path::Path;

use rusqlite::{Connection, params};

use crate::layer::Layer;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ts (
    k_id INTEGER,
    time INTEGER,
    state TEXT,
    value REAL,
    UNIQUE (k_id, time, state)
);
"#;

/// Writer over `time_series.db`.
pub struct AnalyticsSink {
    conn: Connection,
}

impl AnalyticsSink {
    /// Open (and bootstrap, if needed) the analytics database at `path`.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// In-memory sink for tests.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Persist one stitched series in a single transaction. Re-stitching a
    /// (keyword, location) replaces its previous points.
    pub fn write_series(
        &mut self,
        k_id: i64,
        state: &str,
        layer: &Layer,
    ) -> rusqlite::Result<usize> {
        let tx = self.conn.transaction()?;
        for (at, value) in &layer.points {
            tx.execute(
                "INSERT OR REPLACE INTO ts (k_id, time, state, value) VALUES (?1, ?2, ?3, ?4)",
                params![k_id, at.timestamp(), state, value],
            )?;
        }
        tx.commit()?;
        Ok(layer.points.len())
    }

    /// Read one series back, ordered by time.
    pub fn read_series(&self, k_id: i64, state: &str) -> rusqlite::Result<Vec<(i64, f64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT time, value FROM ts WHERE k_id = ?1 AND state = ?2 ORDER BY time",
        )?;
        let rows = stmt.query_map(params![k_id, state], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect()
    }
}
