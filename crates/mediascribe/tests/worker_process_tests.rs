//! The `worker` subcommand driven through `ProcessRunner`, with a shell
//! script standing in for the transcription engine.

#![cfg(unix)]

mod common;

use std::sync::Arc;

use common::{CatalogEntryBuilder, ConfigBuilder, NamedAudioProbe, StaticVolumeProbe, TestHarness};
use mediascribe::config::{EngineConfig, EngineKind};
use mediascribe::dispatcher::{DispatchOptions, Dispatcher};
use mediascribe::worker::{ProcessRunner, TaskOutcome, TaskRunner, TranscriptionTask, WorkerRequest};

const REPLY: &str = r#"{"segments":[{"start":0.0,"end":1.25,"text":"Hello there."}],"info":{"language":"en","language_probability":0.97,"duration":1.25,"duration_after_vad":1.1}}"#;

fn worker_runner() -> ProcessRunner {
    ProcessRunner::new(env!("CARGO_BIN_EXE_mediascribe"), vec!["worker".to_string()])
}

fn script_engine(script: &str) -> EngineConfig {
    let mut engine = EngineConfig::default();
    engine.kind = EngineKind::Command;
    engine.command.program = "sh".to_string();
    engine.command.args = vec!["-c".to_string(), script.to_string(), "{input}".to_string()];
    engine
}

fn request(harness: &TestHarness, engine: EngineConfig) -> WorkerRequest {
    let media = harness.write_media("a.wav", b"RIFF");
    WorkerRequest {
        task: TranscriptionTask {
            file_id: 1,
            physical_path: media.clone(),
            md5: Some("abc".to_string()),
            mime_type: Some("audio/wav".to_string()),
        },
        media_path: media,
        engine,
    }
}

#[test]
fn test_worker_process_returns_transcript() {
    let harness = TestHarness::new();
    let engine = script_engine(&format!("printf '%s' '{}'", REPLY));

    let outcome = worker_runner().run(&request(&harness, engine)).unwrap();
    match outcome {
        TaskOutcome::Success { transcript } => {
            assert_eq!(transcript.segments.len(), 1);
            assert_eq!(transcript.segments[0].text, "Hello there.");
            assert_eq!(transcript.info.language.as_deref(), Some("en"));
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[test]
fn test_engine_failure_is_a_task_error_not_a_fault() {
    let harness = TestHarness::new();
    let engine = script_engine(r#"echo '{"error":"unsupported codec"}'; exit 3"#);

    let outcome = worker_runner().run(&request(&harness, engine)).unwrap();
    match outcome {
        TaskOutcome::Error { message } => assert!(message.contains("unsupported codec")),
        other => panic!("expected error outcome, got {:?}", other),
    }
}

#[test]
fn test_unbuildable_engine_is_reported_by_the_worker() {
    let harness = TestHarness::new();
    let mut engine = EngineConfig::default();
    engine.kind = EngineKind::Command;
    engine.command.program = String::new();

    let outcome = worker_runner().run(&request(&harness, engine)).unwrap();
    assert!(matches!(outcome, TaskOutcome::Error { .. }));
}

#[test]
fn test_dispatch_through_worker_processes() {
    let harness = TestHarness::new();
    let mut ids = Vec::new();
    for name in ["one.wav", "two.wav"] {
        harness.write_media(name, b"RIFF");
        ids.push(harness.catalog(CatalogEntryBuilder::on_volume(name).build()));
    }

    let mut config = ConfigBuilder::new(&harness).build();
    config.engine = script_engine(&format!("printf '%s' '{}'", REPLY));

    let summary = Dispatcher::new(harness.db.clone(), config, Arc::new(worker_runner()))
        .with_volume_probe(Box::new(StaticVolumeProbe(vec![harness.volume()])))
        .with_audio_probe(Box::new(NamedAudioProbe::default()))
        .run(&DispatchOptions::default())
        .unwrap();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.worker_faults, 0);
    for id in ids {
        let runs = harness.runs_for(id);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "success");
        assert!(runs[0].model_in_out.as_deref().unwrap().contains("\"language\":\"en\""));
    }
}
