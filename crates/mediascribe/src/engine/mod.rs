//! Speech-to-text engine boundary.
//!
//! The model itself lives outside this crate. An engine hands it a media
//! file and gets back time-stamped segments plus run metadata, either by
//! running a local program ([`CommandEngine`]) or by calling a remote
//! service ([`RemoteEngine`]). Both return the same [`Transcript`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, EngineKind};
use crate::error::{ConfigError, EngineError};
use crate::secrets::resolve_token;

pub mod command;
pub mod remote;

pub use command::CommandEngine;
pub use remote::RemoteEngine;

/// Per-run model options, recorded alongside each run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOptions {
    pub model_identity: String,
    pub beam_size: u32,
    pub language: Option<String>,
    pub vad_filter: bool,
}

impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            model_identity: config.model_identity.clone(),
            beam_size: config.beam_size,
            language: config.language.clone(),
            vad_filter: config.vad_filter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Metadata reported by the model about one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionInfo {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub language_probability: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub duration_after_vad: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<Segment>,
    pub info: TranscriptionInfo,
}

impl Transcript {
    /// Drops segments that cannot be stored. Blank segments are silence
    /// and vanish quietly; malformed ones produce a warning each.
    pub fn validated(self) -> (Transcript, Vec<String>) {
        let mut warnings = Vec::new();
        let mut segments = Vec::with_capacity(self.segments.len());

        for (index, segment) in self.segments.into_iter().enumerate() {
            let text = segment.text.trim();
            if text.is_empty() {
                continue;
            }
            if !segment.start.is_finite() || !segment.end.is_finite() {
                warnings.push(format!("segment {}: non-finite timestamps", index));
                continue;
            }
            if segment.start < 0.0 || segment.end < segment.start {
                warnings.push(format!(
                    "segment {}: invalid time range {:.3}..{:.3}",
                    index, segment.start, segment.end
                ));
                continue;
            }
            segments.push(Segment {
                start: segment.start,
                end: segment.end,
                text: text.to_string(),
            });
        }

        (
            Transcript {
                segments,
                info: self.info,
            },
            warnings,
        )
    }
}

/// A speech-to-text capability. Implementations are used from a single
/// worker process at a time.
pub trait TranscriptionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn transcribe(&self, media: &Path, options: &EngineOptions) -> Result<Transcript, EngineError>;
}

#[derive(Debug, Deserialize)]
struct EngineReply {
    #[serde(default)]
    segments: Vec<Segment>,
    #[serde(default)]
    info: Option<TranscriptionInfo>,
    #[serde(default)]
    error: Option<String>,
}

/// Decodes the JSON reply shared by every engine:
/// `{segments, info}` on success, `{error}` on failure.
pub fn parse_reply(body: &[u8]) -> Result<Transcript, EngineError> {
    let reply: EngineReply = serde_json::from_slice(body)?;
    if let Some(error) = reply.error {
        return Err(EngineError::Reported(error));
    }
    Ok(Transcript {
        segments: reply.segments,
        info: reply.info.unwrap_or_default(),
    })
}

/// Builds the configured engine, rejecting incomplete settings.
pub fn build_engine(config: &EngineConfig) -> Result<Box<dyn TranscriptionEngine>, ConfigError> {
    match config.kind {
        EngineKind::Command => {
            if config.command.program.trim().is_empty() {
                return Err(ConfigError::Validation {
                    message: "engine.command.program must be set for the command engine"
                        .to_string(),
                });
            }
            Ok(Box::new(CommandEngine::new(
                config.command.program.clone(),
                config.command.args.clone(),
            )))
        }
        EngineKind::Remote => {
            if config.remote.url.trim().is_empty() {
                return Err(ConfigError::Validation {
                    message: "engine.remote.url must be set for the remote engine".to_string(),
                });
            }
            let token = resolve_token(&config.remote)?;
            let engine = RemoteEngine::new(&config.remote.url, config.remote.timeout(), token)
                .map_err(|e| ConfigError::Validation {
                    message: format!("cannot build HTTP client: {}", e),
                })?;
            Ok(Box::new(engine))
        }
    }
}
