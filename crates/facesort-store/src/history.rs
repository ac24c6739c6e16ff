//! Scan history.

use crate::db::Database;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

/// One completed (or cancelled) scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub images_seen: u64,
    pub images_analyzed: u64,
    pub faces_found: u64,
    pub warnings: u64,
    pub cancelled: bool,
}

impl Database {
    pub fn record_scan(&mut self, run: &ScanRun) -> Result<(), StoreError> {
        self.write_txn(|tx| {
            tx.execute(
                "INSERT INTO scan_runs
                   (id, started_at, finished_at, images_seen, images_analyzed,
                    faces_found, warnings, cancelled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run.id,
                    run.started_at.to_rfc3339(),
                    run.finished_at.to_rfc3339(),
                    run.images_seen as i64,
                    run.images_analyzed as i64,
                    run.faces_found as i64,
                    run.warnings as i64,
                    run.cancelled,
                ],
            )?;
            Ok(())
        })
    }

    /// Most recent scans first.
    pub fn scan_history(&self, limit: usize) -> Result<Vec<ScanRun>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, finished_at, images_seen, images_analyzed,
                    faces_found, warnings, cancelled
             FROM scan_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                [row.get::<_, i64>(3)?, row.get(4)?, row.get(5)?, row.get(6)?],
                row.get::<_, bool>(7)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (id, started, finished, [seen, analyzed, faces, warnings], cancelled) = row?;
            runs.push(ScanRun {
                started_at: self.timestamp(&id, &started)?,
                finished_at: self.timestamp(&id, &finished)?,
                id,
                images_seen: seen as u64,
                images_analyzed: analyzed as u64,
                faces_found: faces as u64,
                warnings: warnings as u64,
                cancelled,
            });
        }
        Ok(runs)
    }

    fn timestamp(&self, run: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| self.corrupt(format!("scan run {run} has bad timestamp '{raw}': {e}")))
    }
}
