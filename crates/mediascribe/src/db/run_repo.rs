//! Run log repository: the append-only `transcription_log` and the
//! `transcript_segment` rows belonging to each run.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A run about to be appended.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub file_id: i64,
    pub md5: Option<String>,
    pub path: String,
    pub status: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_secs: f64,
    pub error_message: Option<String>,
    pub model_identity: String,
    pub model_in_out: Option<String>,
    pub run_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRow {
    pub start_secs: f64,
    pub end_secs: f64,
    pub text: String,
}

/// A stored run.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub file_id: i64,
    pub md5: Option<String>,
    pub path: String,
    pub status: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_secs: f64,
    pub error_message: Option<String>,
    pub model_identity: String,
    pub model_in_out: Option<String>,
    pub run_version: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            file_id: row.get("file_id")?,
            md5: row.get("md5")?,
            path: row.get("path")?,
            status: row.get("status")?,
            started_at: row.get("started_at")?,
            ended_at: row.get("ended_at")?,
            duration_secs: row.get("duration_secs")?,
            error_message: row.get("error_message")?,
            model_identity: row.get("model_identity")?,
            model_in_out: row.get("model_in_out")?,
            run_version: row.get("run_version")?,
        })
    }
}

/// Appends a run and its segments in one transaction. Returns the run id.
pub fn insert_with_segments(
    db: &Database,
    run: &NewRun,
    segments: &[SegmentRow],
) -> Result<i64, DatabaseError> {
    db.with_conn_mut(|conn| {
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO transcription_log (file_id, md5, path, status, started_at, ended_at,
             duration_secs, error_message, model_identity, model_in_out, run_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.file_id,
                run.md5,
                run.path,
                run.status,
                run.started_at,
                run.ended_at,
                run.duration_secs,
                run.error_message,
                run.model_identity,
                run.model_in_out,
                run.run_version,
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO transcript_segment (run_id, file_id, segment_index, start_secs,
                 end_secs, text) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (index, segment) in segments.iter().enumerate() {
                stmt.execute(params![
                    run_id,
                    run.file_id,
                    index as i64,
                    segment.start_secs,
                    segment.end_secs,
                    segment.text,
                ])?;
            }
        }

        tx.commit()?;
        Ok(run_id)
    })
}

/// The most recent run for a content checksum.
pub fn latest_for_md5(db: &Database, md5: &str) -> Result<Option<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM transcription_log WHERE md5 = ?1 ORDER BY id DESC LIMIT 1",
                params![md5],
                RunRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// The most recent run for a catalog entry, optionally only among runs
/// with the given status.
pub fn latest_for_file(
    db: &Database,
    file_id: i64,
    status: Option<&str>,
) -> Result<Option<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM transcription_log
                 WHERE file_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY id DESC LIMIT 1",
                params![file_id, status],
                RunRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn list_for_file(db: &Database, file_id: i64) -> Result<Vec<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM transcription_log WHERE file_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![file_id], RunRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn segments_for_run(db: &Database, run_id: i64) -> Result<Vec<SegmentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT start_secs, end_secs, text FROM transcript_segment
             WHERE run_id = ?1 ORDER BY segment_index",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(SegmentRow {
                    start_secs: row.get(0)?,
                    end_secs: row.get(1)?,
                    text: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
