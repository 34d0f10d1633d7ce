use std::path::Path;
use std::time::Duration;

use log::debug;
use reqwest::blocking::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};

use super::{parse_reply, EngineOptions, Transcript, TranscriptionEngine};
use crate::error::EngineError;
use crate::sanitize::{redact_path, redact_url};

/// Posts each file to a transcription service at `<url>/transcribe`.
pub struct RemoteEngine {
    client: reqwest::blocking::Client,
    endpoint: String,
    token: Option<SecretString>,
}

impl RemoteEngine {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        token: Option<SecretString>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: transcribe_endpoint(base_url),
            token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn form(&self, media: &Path, options: &EngineOptions) -> Result<Form, EngineError> {
        let bytes = std::fs::read(media).map_err(|e| EngineError::ReadMedia {
            path: media.to_path_buf(),
            source: e,
        })?;
        let mime = mime_guess::from_path(media).first_or_octet_stream();
        let part = Part::bytes(bytes)
            .file_name(redact_path(media))
            .mime_str(mime.essence_str())?;

        let mut form = Form::new()
            .part("file", part)
            .text("whisper_model_alias", options.model_identity.clone())
            .text("whisper_beam_size", options.beam_size.to_string())
            .text("vad_filter", options.vad_filter.to_string());
        if let Some(language) = &options.language {
            form = form.text("language", language.clone());
        }
        Ok(form)
    }
}

fn transcribe_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/transcribe") {
        base.to_string()
    } else {
        format!("{}/transcribe", base)
    }
}

impl TranscriptionEngine for RemoteEngine {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn transcribe(&self, media: &Path, options: &EngineOptions) -> Result<Transcript, EngineError> {
        let form = self.form(media, options)?;
        debug!(
            "Posting {} to {}",
            redact_path(media),
            redact_url(&self.endpoint)
        );

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request.send()?;
        let status = response.status();
        let body = response.bytes()?;

        // Services answer failures with `{error}`, often alongside a 5xx
        let reply = parse_reply(&body);
        if status.is_success() || matches!(reply, Err(EngineError::Reported(_))) {
            return reply;
        }
        Err(EngineError::Exited {
            status: i32::from(status.as_u16()),
            stderr: String::from_utf8_lossy(&body).chars().take(500).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_is_derived_from_base_url() {
        assert_eq!(
            transcribe_endpoint("http://gpu-box:8000"),
            "http://gpu-box:8000/transcribe"
        );
        assert_eq!(
            transcribe_endpoint("http://gpu-box:8000/"),
            "http://gpu-box:8000/transcribe"
        );
        assert_eq!(
            transcribe_endpoint("http://gpu-box:8000/transcribe"),
            "http://gpu-box:8000/transcribe"
        );
    }

    #[test]
    fn test_unreadable_media_fails_before_request() {
        let engine = RemoteEngine::new("http://127.0.0.1:9", Duration::from_secs(1), None).unwrap();
        let options = EngineOptions {
            model_identity: "distil-large-v3-ct2".to_string(),
            beam_size: 5,
            language: None,
            vad_filter: true,
        };
        let err = engine
            .transcribe(Path::new("/nonexistent/clip.wav"), &options)
            .unwrap_err();
        assert!(matches!(err, EngineError::ReadMedia { .. }));
    }
}
