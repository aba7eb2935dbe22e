//! Speech-to-text collaborator client.
//!
//! Uploads one encoded speech segment and receives the recognized text
//! plus a sentence-completeness classification. An empty `text` is a valid,
//! non-error response meaning nothing usable was detected.

use crate::config::BackendConfig;
use crate::error::{Result, VoiceError};
use crate::segment::AudioSegment;
use serde::Deserialize;

/// Whether a transcript fragment reads as a finished sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Completeness {
    /// Semantically finished; dispatch immediately.
    Complete,
    /// Likely to continue; wait for more before dispatching.
    #[default]
    Incomplete,
}

/// Transcription result for one segment.
#[derive(Debug, Clone, Deserialize)]
pub struct SttResult {
    /// Recognized text; empty when nothing usable was detected.
    #[serde(default)]
    pub text: String,
    /// Completeness classification of `text`.
    #[serde(default)]
    pub completeness: Completeness,
}

/// HTTP client for the STT collaborator.
#[derive(Debug, Clone)]
pub struct TranscriptionClient {
    client: reqwest::Client,
    base_url: String,
}

impl TranscriptionClient {
    /// Create a client for the configured backend.
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Transcribe one encoded segment.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Transcription`] on transport failures,
    /// non-success status codes, or an unparseable response body.
    pub async fn transcribe(&self, segment: &AudioSegment) -> Result<SttResult> {
        let part = reqwest::multipart::Part::bytes(segment.data.clone())
            .file_name(segment.format.file_name())
            .mime_str(segment.format.mime())
            .map_err(|e| VoiceError::Transcription(format!("invalid mime: {e}")))?;
        let form = reqwest::multipart::Form::new().part("audio", part);

        let response = self
            .client
            .post(format!("{}/api/voice/stt", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Transcription(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(VoiceError::Transcription(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json::<SttResult>()
            .await
            .map_err(|e| VoiceError::Transcription(format!("invalid response: {e}")))
    }
}
