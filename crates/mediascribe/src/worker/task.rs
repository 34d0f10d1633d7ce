use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{Transcript, TranscriptionInfo};

/// One unit of dispatch: a catalog entry resolved to where it currently
/// lives on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionTask {
    pub file_id: i64,
    pub physical_path: PathBuf,
    pub md5: Option<String>,
    pub mime_type: Option<String>,
}

/// Terminal result of one transcription attempt. Every variant is
/// recorded; none is dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        transcript: Transcript,
    },
    PartialSuccess {
        transcript: Transcript,
        warnings: Vec<String>,
    },
    Error {
        message: String,
    },
}

impl TaskOutcome {
    /// Classifies an engine transcript by whether validation had to drop
    /// anything.
    pub fn from_transcript(transcript: Transcript) -> Self {
        let (transcript, warnings) = transcript.validated();
        if warnings.is_empty() {
            TaskOutcome::Success { transcript }
        } else {
            TaskOutcome::PartialSuccess {
                transcript,
                warnings,
            }
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TaskOutcome::Error {
            message: message.into(),
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            TaskOutcome::Success { .. } => RunStatus::Success,
            TaskOutcome::PartialSuccess { .. } => RunStatus::PartialSuccess,
            TaskOutcome::Error { .. } => RunStatus::Error,
        }
    }

    pub fn transcript(&self) -> Option<&Transcript> {
        match self {
            TaskOutcome::Success { transcript } | TaskOutcome::PartialSuccess { transcript, .. } => {
                Some(transcript)
            }
            TaskOutcome::Error { .. } => None,
        }
    }

    pub fn info(&self) -> Option<&TranscriptionInfo> {
        self.transcript().map(|t| &t.info)
    }

    /// Text stored in the run log's `error_message` column.
    pub fn error_message(&self) -> Option<String> {
        match self {
            TaskOutcome::Success { .. } => None,
            TaskOutcome::PartialSuccess { warnings, .. } => Some(warnings.join("; ")),
            TaskOutcome::Error { message } => Some(message.clone()),
        }
    }
}

/// Value of the run log's `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartialSuccess => "partial_success",
            RunStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a selected task never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another dispatcher holds the lease.
    Contended,
    /// A racing dispatcher already succeeded on the same content.
    AlreadyDone,
}

/// Where a task ended up.
///
/// The happy path is `Selected -> Claimed -> Running -> Recorded`; every
/// other variant is terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Selected,
    Claimed,
    Running,
    Recorded { status: RunStatus, run_id: i64 },
    /// The run finished but the run log could not be written.
    Unrecorded { status: RunStatus, reason: String },
    Skipped(SkipReason),
    /// Dropped before it started because the pool broke.
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            TaskState::Selected | TaskState::Claimed | TaskState::Running
        )
    }
}

/// What the pool reports back for every submitted task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub file_id: i64,
    pub state: TaskState,
    /// The worker process crashed or could not be started.
    pub worker_fault: bool,
}

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Builds a run version unique per attempt: start time, process id and a
/// process-wide sequence number.
pub fn next_run_version(started_at: DateTime<Utc>) -> String {
    let seq = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-p{}-{}",
        crate::db::timestamp(started_at),
        std::process::id(),
        seq
    )
}
