//! Container conversion ahead of transcription.
//!
//! Some containers decode poorly inside the engine, so they are turned
//! into 16 kHz mono PCM WAV first. Conversion is memory hungry; it waits
//! for enough free memory before starting.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use sysinfo::System;

use crate::config::ConversionConfig;
use crate::error::WorkerError;
use crate::sanitize::{hash_path, redact_path};

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// A converted file that is deleted when dropped.
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
}

impl TempArtifact {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed conversion artifact {}", redact_path(&self.path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove conversion artifact {}: {}",
                redact_path(&self.path),
                e
            ),
        }
    }
}

/// Source of the free-memory figure the gate waits on.
pub trait MemoryGauge: Send + Sync {
    fn available_mb(&self) -> u64;
}

pub struct SystemMemory;

impl MemoryGauge for SystemMemory {
    fn available_mb(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.available_memory() / BYTES_PER_MIB
    }
}

pub struct MediaConverter {
    config: ConversionConfig,
    gauge: Box<dyn MemoryGauge>,
}

impl MediaConverter {
    pub fn new(config: ConversionConfig) -> Self {
        Self::with_gauge(config, Box::new(SystemMemory))
    }

    pub fn with_gauge(config: ConversionConfig, gauge: Box<dyn MemoryGauge>) -> Self {
        Self { config, gauge }
    }

    /// True if files with this extension are converted before handoff.
    pub fn needs_conversion(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.config
            .extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    fn temp_dir(&self) -> PathBuf {
        self.config.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Where the converted file for `source` is written.
    pub fn artifact_path(&self, source: &Path) -> PathBuf {
        self.temp_dir()
            .join(format!("mediascribe-{}-{}.wav", hash_path(source), std::process::id()))
    }

    /// Blocks until the gauge reports enough headroom or the wait budget
    /// runs out.
    pub fn wait_for_memory(&self) -> Result<(), WorkerError> {
        let needed = self.config.min_free_memory_mb;
        let max_wait = Duration::from_secs(self.config.max_wait_secs);
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let started = Instant::now();

        loop {
            let available = self.gauge.available_mb();
            if available >= needed {
                return Ok(());
            }
            if started.elapsed() >= max_wait {
                return Err(WorkerError::MemoryHeadroom {
                    needed_mb: needed,
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            debug!("Waiting for memory: {} MiB free, {} MiB needed", available, needed);
            thread::sleep(poll);
        }
    }

    /// Converts `source` to WAV. The returned artifact owns the output.
    pub fn convert(&self, source: &Path) -> Result<TempArtifact, WorkerError> {
        self.wait_for_memory()?;

        let target = self.artifact_path(source);
        let artifact = TempArtifact::new(target.clone());
        info!("Converting {} to WAV", redact_path(source));

        let output = Command::new(&self.config.ffmpeg)
            .args(["-nostdin", "-y", "-loglevel", "error", "-i"])
            .arg(source)
            .args(["-vn", "-ac", "1", "-ar", "16000", "-c:a", "pcm_s16le"])
            .arg(&target)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| WorkerError::Conversion {
                path: source.to_path_buf(),
                reason: format!("cannot start {}: {}", self.config.ffmpeg, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkerError::Conversion {
                path: source.to_path_buf(),
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct Rising(Arc<AtomicU64>);

    impl MemoryGauge for Rising {
        fn available_mb(&self) -> u64 {
            self.0.fetch_add(512, Ordering::SeqCst)
        }
    }

    struct Fixed(u64);

    impl MemoryGauge for Fixed {
        fn available_mb(&self) -> u64 {
            self.0
        }
    }

    fn config() -> ConversionConfig {
        ConversionConfig {
            extensions: vec!["mkv".to_string(), ".webm".to_string()],
            min_free_memory_mb: 1024,
            poll_interval_ms: 1,
            max_wait_secs: 0,
            ..ConversionConfig::default()
        }
    }

    #[test]
    fn test_needs_conversion_by_extension() {
        let converter = MediaConverter::with_gauge(config(), Box::new(Fixed(4096)));
        assert!(converter.needs_conversion(Path::new("/media/card/a.MKV")));
        assert!(converter.needs_conversion(Path::new("b.webm")));
        assert!(!converter.needs_conversion(Path::new("c.mp4")));
        assert!(!converter.needs_conversion(Path::new("noext")));
    }

    #[test]
    fn test_memory_gate_times_out() {
        let converter = MediaConverter::with_gauge(config(), Box::new(Fixed(100)));
        assert!(matches!(
            converter.wait_for_memory(),
            Err(WorkerError::MemoryHeadroom { needed_mb: 1024, .. })
        ));
    }

    #[test]
    fn test_memory_gate_waits_for_headroom() {
        let mut cfg = config();
        cfg.max_wait_secs = 5;
        let gauge = Arc::new(AtomicU64::new(0));
        let converter = MediaConverter::with_gauge(cfg, Box::new(Rising(Arc::clone(&gauge))));

        converter.wait_for_memory().unwrap();
        assert!(gauge.load(Ordering::SeqCst) > 1024);
    }

    #[test]
    fn test_artifact_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.wav");
        std::fs::write(&path, b"RIFF").unwrap();

        let artifact = TempArtifact::new(path.clone());
        assert!(artifact.path().exists());
        drop(artifact);
        assert!(!path.exists());

        // Dropping an artifact that was never written is fine
        drop(TempArtifact::new(dir.path().join("never.wav")));
    }

    #[test]
    fn test_failed_conversion_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.ffmpeg = "mediascribe-no-such-ffmpeg".to_string();
        cfg.temp_dir = Some(dir.path().to_path_buf());
        let converter = MediaConverter::with_gauge(cfg, Box::new(Fixed(4096)));

        let source = dir.path().join("clip.mkv");
        assert!(matches!(
            converter.convert(&source),
            Err(WorkerError::Conversion { .. })
        ));
        assert!(!converter.artifact_path(&source).exists());
    }

    #[test]
    fn test_artifact_name_hides_source_name() {
        let converter = MediaConverter::with_gauge(config(), Box::new(Fixed(4096)));
        let path = converter.artifact_path(Path::new("/media/card/Private Name.mkv"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("mediascribe-"));
        assert!(!name.contains("Private"));
    }
}
