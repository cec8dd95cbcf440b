//! Speech-to-text transcription.
//!
//! [`Transcriber`] is a single remote call; [`TranscriptionClient`] wraps a
//! backend with the per-call deadline and the retry policy for transient
//! failures.

use async_trait::async_trait;
use casabot_proto::AudioFormat;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

mod azure;
mod retry;
pub mod wav;

pub use azure::{ApiKey, AzureTranscriber};
pub use retry::RetryPolicy;

/// Immutable snapshot of one finalized utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionRequest {
    audio: Vec<u8>,
    format: AudioFormat,
    language: Option<String>,
    model: String,
    api_version: String,
}

impl TranscriptionRequest {
    pub fn new(
        audio: Vec<u8>,
        format: AudioFormat,
        language: Option<String>,
        model: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            audio,
            format,
            language,
            model: model.into(),
            api_version: api_version.into(),
        }
    }

    /// Raw PCM bytes, in the order they arrived.
    pub fn audio(&self) -> &[u8] {
        &self.audio
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Language hint, `None` for automatic detection.
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }
}

/// Classified transcription failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscribeError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("rate limited by the transcription service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transcription request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("invalid audio: {0}")]
    InvalidAudio(String),
}

impl TranscribeError {
    /// Failures a later attempt may not repeat.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TranscribeError::RateLimited { .. }
                | TranscribeError::Timeout
                | TranscribeError::Network(_)
        )
    }

    /// Server-requested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TranscribeError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Text (possibly empty) or a classified failure.
pub type TranscriptionResult = Result<String, TranscribeError>;

/// One remote transcription call.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, request: &TranscriptionRequest) -> TranscriptionResult;
}

/// Backend wrapper adding the per-call deadline and retries.
pub struct TranscriptionClient {
    backend: Arc<dyn Transcriber>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl TranscriptionClient {
    pub fn new(backend: Arc<dyn Transcriber>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            backend,
            retry,
            timeout,
        }
    }

    /// Transcribe the request, retrying transient failures with backoff.
    ///
    /// Authentication, model and request errors are returned on first
    /// occurrence.
    pub async fn transcribe(&self, request: &TranscriptionRequest) -> TranscriptionResult {
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let result = tokio::time::timeout(self.timeout, self.backend.transcribe(request))
                .await
                .unwrap_or(Err(TranscribeError::Timeout));

            match result {
                Ok(text) => {
                    debug!(
                        attempt = attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        chars = text.len(),
                        "Transcription succeeded"
                    );
                    return Ok(text);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt, e.retry_after());
                    warn!(
                        attempt = attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient transcription failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempt = attempt, error = %e, "Transcription failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
