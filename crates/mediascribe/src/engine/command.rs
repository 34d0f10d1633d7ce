use std::path::Path;
use std::process::{Command, Stdio};

use log::debug;

use super::{parse_reply, EngineOptions, Transcript, TranscriptionEngine};
use crate::error::EngineError;
use crate::sanitize::redact_path;

/// Keeps error messages bounded when a model dumps a long traceback.
const STDERR_TAIL_BYTES: usize = 2000;

/// Runs a local program per file and reads its JSON reply from stdout.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Expands placeholders in the configured arguments. An argument that
    /// consisted only of `{language}` is dropped when no language is set,
    /// letting the model detect it.
    pub fn render_args(&self, media: &Path, options: &EngineOptions) -> Vec<String> {
        let input = media.to_string_lossy();
        let language = options.language.as_deref().unwrap_or("");
        let beam_size = options.beam_size.to_string();
        let vad_filter = options.vad_filter.to_string();

        let mut rendered = Vec::with_capacity(self.args.len() + 1);
        for arg in &self.args {
            let value = arg
                .replace("{input}", &input)
                .replace("{model}", &options.model_identity)
                .replace("{beam_size}", &beam_size)
                .replace("{language}", language)
                .replace("{vad_filter}", &vad_filter);
            if value.is_empty() && !arg.is_empty() {
                continue;
            }
            rendered.push(value);
        }

        if !self.args.iter().any(|a| a.contains("{input}")) {
            rendered.push(input.into_owned());
        }
        rendered
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

impl TranscriptionEngine for CommandEngine {
    fn name(&self) -> &'static str {
        "command"
    }

    fn transcribe(&self, media: &Path, options: &EngineOptions) -> Result<Transcript, EngineError> {
        let args = self.render_args(media, options);
        debug!(
            "Running engine {} on {}",
            self.program,
            redact_path(media)
        );

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EngineError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            // The reply may still carry a structured error
            if let Err(EngineError::Reported(message)) = parse_reply(&output.stdout) {
                return Err(EngineError::Reported(message));
            }
            return Err(EngineError::Exited {
                status: output.status.code().unwrap_or(-1),
                stderr: stderr_tail(&output.stderr),
            });
        }

        parse_reply(&output.stdout)
    }
}
