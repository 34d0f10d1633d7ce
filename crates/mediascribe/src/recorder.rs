//! Persisting run outcomes.
//!
//! Every attempt is appended; nothing is updated in place. The current
//! state of a file or of a piece of content is whatever its latest run
//! says.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::db::run_repo::{self, NewRun, SegmentRow};
use crate::db::{self, Database, DatabaseError};
use crate::engine::EngineOptions;
use crate::worker::TaskOutcome;

/// Longest error text kept in the run log.
pub const MAX_ERROR_CHARS: usize = 1000;

/// One finished attempt, ready to be written.
#[derive(Debug, Clone)]
pub struct RunRecord<'a> {
    pub file_id: i64,
    pub md5: Option<&'a str>,
    pub path: &'a str,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: &'a TaskOutcome,
    pub options: &'a EngineOptions,
    pub run_version: String,
}

pub trait ResultRecorder: Send + Sync {
    /// Appends the run and returns its id.
    fn record(&self, record: &RunRecord<'_>) -> Result<i64, DatabaseError>;
}

/// Writes runs and their segments to the catalog database.
#[derive(Clone)]
pub struct SqliteRecorder {
    db: Database,
}

impl SqliteRecorder {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

impl ResultRecorder for SqliteRecorder {
    fn record(&self, record: &RunRecord<'_>) -> Result<i64, DatabaseError> {
        let outcome = record.outcome;
        let duration = (record.ended_at - record.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let model_in_out = json!({
            "options": record.options,
            "info": outcome.info(),
        });

        let run = NewRun {
            file_id: record.file_id,
            md5: record.md5.map(str::to_string),
            path: record.path.to_string(),
            status: outcome.status().as_str().to_string(),
            started_at: db::timestamp(record.started_at),
            ended_at: db::timestamp(record.ended_at),
            duration_secs: duration,
            error_message: outcome
                .error_message()
                .map(|m| truncate_chars(&m, MAX_ERROR_CHARS)),
            model_identity: record.options.model_identity.clone(),
            model_in_out: Some(model_in_out.to_string()),
            run_version: record.run_version.clone(),
        };

        let segments: Vec<SegmentRow> = outcome
            .transcript()
            .map(|t| {
                t.segments
                    .iter()
                    .map(|s| SegmentRow {
                        start_secs: s.start,
                        end_secs: s.end,
                        text: s.text.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let run_id = run_repo::insert_with_segments(&self.db, &run, &segments)?;
        log::debug!(
            "Recorded run {} ({}) for file {}",
            run_id,
            run.status,
            record.file_id
        );
        Ok(run_id)
    }
}
