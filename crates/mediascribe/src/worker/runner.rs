//! Running one task to an outcome, either in a child process or inline.
//!
//! The child is this same executable started with the hidden `worker`
//! subcommand. It reads one [`WorkerRequest`] as JSON on stdin and writes
//! one [`TaskOutcome`] as JSON on stdout, then exits. A child that dies
//! without a reply is a worker fault, distinct from a task that failed.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::task::{TaskOutcome, TranscriptionTask};
use crate::config::EngineConfig;
use crate::engine::{build_engine, EngineOptions, TranscriptionEngine};
use crate::error::RunnerError;
use crate::sanitize::redact_path;

/// Everything a worker needs to transcribe one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task: TranscriptionTask,
    /// The file handed to the engine; a conversion artifact when the
    /// source needed converting.
    pub media_path: PathBuf,
    pub engine: EngineConfig,
}

/// Executes worker requests. Implementations may be called from several
/// pool threads at once.
pub trait TaskRunner: Send + Sync {
    fn run(&self, request: &WorkerRequest) -> Result<TaskOutcome, RunnerError>;
}

/// Runs a request against an engine. Never fails: engine errors become an
/// `Error` outcome.
pub fn execute_request(engine: &dyn TranscriptionEngine, request: &WorkerRequest) -> TaskOutcome {
    let media = request.media_path.as_path();
    if !media.is_file() {
        return TaskOutcome::error(format!("media vanished before transcription: {}", redact_path(media)));
    }

    let options = EngineOptions::from(&request.engine);
    match engine.transcribe(media, &options) {
        Ok(transcript) => TaskOutcome::from_transcript(transcript),
        Err(e) => {
            warn!("Engine {} failed on file {}: {}", engine.name(), request.task.file_id, e);
            TaskOutcome::error(e.to_string())
        }
    }
}

/// Worker-process entry: one request in, one outcome out.
pub fn run_worker_process<R: Read, W: Write>(mut input: R, mut output: W) -> Result<(), RunnerError> {
    let mut raw = Vec::new();
    input.read_to_end(&mut raw)?;
    let request: WorkerRequest = serde_json::from_slice(&raw)?;

    let outcome = match build_engine(&request.engine) {
        Ok(engine) => execute_request(engine.as_ref(), &request),
        Err(e) => TaskOutcome::error(e.to_string()),
    };

    serde_json::to_writer(&mut output, &outcome)?;
    output.flush()?;
    Ok(())
}

/// Starts one child process per request.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-executes the running binary as `<exe> worker`.
    pub fn current_exe() -> Result<Self, RunnerError> {
        let exe = std::env::current_exe().map_err(RunnerError::Spawn)?;
        Ok(Self::new(exe, vec!["worker".to_string()]))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl TaskRunner for ProcessRunner {
    fn run(&self, request: &WorkerRequest) -> Result<TaskOutcome, RunnerError> {
        let payload = serde_json::to_vec(request)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(RunnerError::Spawn)?;
        debug!("Worker process {} started for file {}", child.id(), request.task.file_id);

        if let Some(mut stdin) = child.stdin.take() {
            // A child that dies early closes the pipe; its exit status says more
            if let Err(e) = stdin.write_all(&payload) {
                debug!("Writing worker request failed: {}", e);
            }
        }

        let mut stdout = Vec::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_end(&mut stdout)?;
        }
        let status = child.wait()?;

        if !status.success() {
            return Err(RunnerError::Crashed {
                status: status.to_string(),
            });
        }
        if stdout.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(RunnerError::Crashed {
                status: "exited without a reply".to_string(),
            });
        }

        Ok(serde_json::from_slice(&stdout)?)
    }
}

/// Runs requests on the calling thread with a shared engine. For engines
/// that are safe to reuse, and for tests.
#[derive(Clone)]
pub struct InlineRunner {
    engine: Arc<dyn TranscriptionEngine>,
}

impl InlineRunner {
    pub fn new(engine: Arc<dyn TranscriptionEngine>) -> Self {
        Self { engine }
    }
}

impl TaskRunner for InlineRunner {
    fn run(&self, request: &WorkerRequest) -> Result<TaskOutcome, RunnerError> {
        Ok(execute_request(self.engine.as_ref(), request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Segment, Transcript, TranscriptionInfo};
    use crate::error::EngineError;

    struct Echo;

    impl TranscriptionEngine for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn transcribe(&self, media: &Path, _: &EngineOptions) -> Result<Transcript, EngineError> {
            if media.to_string_lossy().contains("broken") {
                return Err(EngineError::Reported("decoder failed".to_string()));
            }
            Ok(Transcript {
                segments: vec![Segment {
                    start: 0.0,
                    end: 1.0,
                    text: "hello".to_string(),
                }],
                info: TranscriptionInfo::default(),
            })
        }
    }

    fn request(media: PathBuf) -> WorkerRequest {
        WorkerRequest {
            task: TranscriptionTask {
                file_id: 1,
                physical_path: media.clone(),
                md5: Some("aaa".to_string()),
                mime_type: Some("audio/wav".to_string()),
            },
            media_path: media,
            engine: EngineConfig::default(),
        }
    }

    #[test]
    fn test_inline_runner_success_and_error() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.wav");
        let broken = dir.path().join("broken.wav");
        std::fs::write(&good, b"RIFF").unwrap();
        std::fs::write(&broken, b"RIFF").unwrap();

        let runner = InlineRunner::new(Arc::new(Echo));
        assert!(matches!(
            runner.run(&request(good)).unwrap(),
            TaskOutcome::Success { .. }
        ));
        let outcome = runner.run(&request(broken)).unwrap();
        assert!(outcome.error_message().unwrap().contains("decoder failed"));
    }

    #[test]
    fn test_vanished_media_is_task_error() {
        let outcome = execute_request(&Echo, &request(PathBuf::from("/nonexistent/a.wav")));
        assert!(matches!(outcome, TaskOutcome::Error { .. }));
    }

    #[test]
    fn test_worker_process_without_engine_replies_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("a.wav");
        std::fs::write(&media, b"RIFF").unwrap();

        let input = serde_json::to_vec(&request(media)).unwrap();
        let mut output = Vec::new();
        run_worker_process(input.as_slice(), &mut output).unwrap();

        let outcome: TaskOutcome = serde_json::from_slice(&output).unwrap();
        assert!(outcome
            .error_message()
            .unwrap()
            .contains("engine.command.program"));
    }

    #[test]
    fn test_worker_process_rejects_garbage() {
        let mut output = Vec::new();
        assert!(matches!(
            run_worker_process(&b"not json"[..], &mut output),
            Err(RunnerError::Protocol(_))
        ));
    }

    #[test]
    fn test_missing_worker_binary_is_spawn_fault() {
        let runner = ProcessRunner::new("/nonexistent/mediascribe", vec!["worker".to_string()]);
        assert!(matches!(
            runner.run(&request(PathBuf::from("a.wav"))),
            Err(RunnerError::Spawn(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_crash_is_fault() {
        let runner = ProcessRunner::new("sh", vec!["-c".to_string(), "exit 137".to_string()]);
        assert!(matches!(
            runner.run(&request(PathBuf::from("a.wav"))),
            Err(RunnerError::Crashed { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_reply_is_parsed() {
        let runner = ProcessRunner::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"cat >/dev/null; echo '{"status":"error","message":"no gpu"}'"#.to_string(),
            ],
        );
        let outcome = runner.run(&request(PathBuf::from("a.wav"))).unwrap();
        assert_eq!(outcome, TaskOutcome::error("no gpu"));
    }
}
