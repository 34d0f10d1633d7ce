use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Deserialize;

use crate::config::ProbeConfig;
use crate::sanitize::redact_path;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Answers whether a media file carries at least one audio stream.
pub trait AudioProbe: Send + Sync {
    fn has_audio(&self, path: &Path) -> bool;
}

/// Asks `ffprobe` for the first audio stream. Any failure, including a
/// timeout, is reported as "no audio".
#[derive(Debug, Clone)]
pub struct FfprobeAudioProbe {
    program: String,
    timeout: Duration,
}

impl FfprobeAudioProbe {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(config.ffprobe.clone(), Duration::from_secs(config.timeout_secs))
    }

    fn run(&self, path: &Path) -> Result<Vec<u8>, String> {
        let mut child = Command::new(&self.program)
            .args([
                "-v",
                "error",
                "-select_streams",
                "a:0",
                "-show_entries",
                "stream=codec_type",
                "-of",
                "json",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("cannot start {}: {}", self.program, e))?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("timed out after {:?}", self.timeout));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(e.to_string()),
            }
        };

        if !status.success() {
            return Err(format!("exited with {}", status));
        }

        let mut stdout = Vec::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_end(&mut stdout).map_err(|e| e.to_string())?;
        }
        Ok(stdout)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeReply {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_type: Option<String>,
}

/// Reads `ffprobe -of json` output.
pub fn reply_has_audio(json: &[u8]) -> bool {
    match serde_json::from_slice::<ProbeReply>(json) {
        Ok(reply) => reply
            .streams
            .iter()
            .any(|s| s.codec_type.as_deref() == Some("audio")),
        Err(_) => false,
    }
}

impl AudioProbe for FfprobeAudioProbe {
    fn has_audio(&self, path: &Path) -> bool {
        match self.run(path) {
            Ok(stdout) => {
                let found = reply_has_audio(&stdout);
                debug!("Audio probe {}: {}", redact_path(path), found);
                found
            }
            Err(reason) => {
                warn!("Audio probe failed for {}: {}", redact_path(path), reason);
                false
            }
        }
    }
}
