//! Rendering stored transcripts as SRT subtitles or timestamped text.

use std::fmt::Write;
use std::str::FromStr;

use crate::db::run_repo::{self, RunRow, SegmentRow};
use crate::db::{Database, DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TranscriptFormat {
    #[default]
    Srt,
    Txt,
}

impl FromStr for TranscriptFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "srt" => Ok(Self::Srt),
            "txt" | "text" => Ok(Self::Txt),
            other => Err(format!("unknown transcript format '{}'", other)),
        }
    }
}

fn split(seconds: f64) -> (u64, u64, u64, u64) {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    (total_secs / 3600, (total_secs % 3600) / 60, total_secs % 60, ms)
}

/// `HH:MM:SS,mmm`
pub fn srt_timestamp(seconds: f64) -> String {
    let (h, m, s, ms) = split(seconds);
    format!("{:02}:{:02}:{:02},{:03}", h, m, s, ms)
}

/// `HH:MM:SS`
pub fn clock_timestamp(seconds: f64) -> String {
    let (h, m, s, _) = split(seconds);
    format!("{:02}:{:02}:{:02}", h, m, s)
}

pub fn render(segments: &[SegmentRow], format: TranscriptFormat) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        // Writing to a String cannot fail
        let _ = match format {
            TranscriptFormat::Srt => write!(
                out,
                "{}\n{} --> {}\n{}\n\n",
                i + 1,
                srt_timestamp(seg.start_secs),
                srt_timestamp(seg.end_secs),
                seg.text
            ),
            TranscriptFormat::Txt => writeln!(
                out,
                "[{} -> {}] {}",
                clock_timestamp(seg.start_secs),
                clock_timestamp(seg.end_secs),
                seg.text
            ),
        };
    }
    out
}

/// The segments of the latest run of a file that produced any, with the
/// run they came from.
pub fn latest_transcript(
    db: &Database,
    file_id: i64,
) -> Result<Option<(RunRow, Vec<SegmentRow>)>, DatabaseError> {
    for run in run_repo::list_for_file(db, file_id)?.into_iter().rev() {
        if run.status == "error" {
            continue;
        }
        let segments = run_repo::segments_for_run(db, run.id)?;
        return Ok(Some((run, segments)));
    }
    Ok(None)
}
