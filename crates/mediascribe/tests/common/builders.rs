//! Builders and fakes for dispatch tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use mediascribe::config::Config;
use mediascribe::db::catalog_repo::NewCatalogEntry;
use mediascribe::engine::{EngineOptions, Segment, Transcript, TranscriptionEngine, TranscriptionInfo};
use mediascribe::error::{EngineError, ProbeError, RunnerError};
use mediascribe::selector::AudioProbe;
use mediascribe::volume::{VolumeMount, VolumeProbe};
use mediascribe::worker::{TaskOutcome, TaskRunner, WorkerRequest};

use super::harness::{TestHarness, VOLUME_UUID};

/// Builder for `Config` instances pointing at a harness catalog.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new(harness: &TestHarness) -> Self {
        let mut config = Config::default();
        config.catalog.path = harness.db_path.clone();
        config.catalog.lease_ttl_secs = 60;
        config.dispatch.max_parallel_workers = 2;
        config.dispatch.batch_size = 10;
        config.conversion.extensions = Vec::new();
        config.engine.command.program = "unused".to_string();
        Self { config }
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.config.dispatch.max_parallel_workers = count;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.dispatch.batch_size = size;
        self
    }

    pub fn max_pool_faults(mut self, faults: usize) -> Self {
        self.config.dispatch.max_pool_faults = faults;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Builder for catalog rows on the harness volume.
pub struct CatalogEntryBuilder {
    entry: NewCatalogEntry,
}

impl CatalogEntryBuilder {
    /// A row for `relative` on the harness volume, recorded under a stale
    /// physical path so only the logical path resolves.
    pub fn on_volume(relative: &str) -> Self {
        Self {
            entry: NewCatalogEntry {
                path: format!("/stale/mount/{}", relative),
                md5: Some(format!("md5-{}", relative)),
                size: Some(1_000),
                mime_type: Some("audio/wav".to_string()),
                mount_uuid: Some(VOLUME_UUID.to_string()),
                relative_path: Some(relative.to_string()),
            },
        }
    }

    pub fn md5(mut self, md5: &str) -> Self {
        self.entry.md5 = Some(md5.to_string());
        self
    }

    pub fn without_md5(mut self) -> Self {
        self.entry.md5 = None;
        self
    }

    pub fn size(mut self, size: i64) -> Self {
        self.entry.size = Some(size);
        self
    }

    pub fn mime(mut self, mime: &str) -> Self {
        self.entry.mime_type = Some(mime.to_string());
        self
    }

    pub fn build(self) -> NewCatalogEntry {
        self.entry
    }
}

/// Engine returning one fixed segment per file, counting calls.
#[derive(Default)]
pub struct FakeEngine {
    pub calls: AtomicUsize,
}

impl FakeEngine {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TranscriptionEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn transcribe(&self, media: &Path, options: &EngineOptions) -> Result<Transcript, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = media
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.contains("corrupt") {
            return Err(EngineError::Reported("invalid data found".to_string()));
        }
        Ok(Transcript {
            segments: vec![Segment {
                start: 0.0,
                end: 2.0,
                text: format!("transcript of {}", name),
            }],
            info: TranscriptionInfo {
                language: options.language.clone().or_else(|| Some("en".to_string())),
                language_probability: Some(0.99),
                duration: Some(2.0),
                duration_after_vad: Some(1.8),
            },
        })
    }
}

/// Audio probe that reports no audio for files whose name contains
/// "silent". Counts probes.
#[derive(Default)]
pub struct NamedAudioProbe {
    pub probes: AtomicUsize,
}

impl AudioProbe for NamedAudioProbe {
    fn has_audio(&self, path: &Path) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        !path.to_string_lossy().contains("silent")
    }
}

/// Volume probe with a fixed answer.
pub struct StaticVolumeProbe(pub Vec<VolumeMount>);

impl VolumeProbe for StaticVolumeProbe {
    fn os_name(&self) -> &'static str {
        "test"
    }

    fn probe(&self) -> Result<Vec<VolumeMount>, ProbeError> {
        Ok(self.0.clone())
    }
}

/// Volume probe whose tool is always missing.
pub struct FailingVolumeProbe;

impl VolumeProbe for FailingVolumeProbe {
    fn os_name(&self) -> &'static str {
        "test"
    }

    fn probe(&self) -> Result<Vec<VolumeMount>, ProbeError> {
        Err(ProbeError::ToolFailed {
            program: "blkid".to_string(),
            status: 2,
        })
    }
}

/// Runner whose worker process always dies, as under the OOM killer.
#[derive(Default)]
pub struct CrashingRunner {
    pub started: Mutex<Vec<i64>>,
}

impl TaskRunner for CrashingRunner {
    fn run(&self, request: &WorkerRequest) -> Result<TaskOutcome, RunnerError> {
        self.started
            .lock()
            .expect("runner lock poisoned")
            .push(request.task.file_id);
        Err(RunnerError::Crashed {
            status: "signal: 9 (SIGKILL)".to_string(),
        })
    }
}
