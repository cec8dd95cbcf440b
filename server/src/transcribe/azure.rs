//! Azure OpenAI audio transcription backend.

use super::wav::encode_wav;
use super::{TranscribeError, Transcriber, TranscriptionRequest, TranscriptionResult};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{StatusCode, Url, header::HeaderMap};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_TEXT: usize = 200;

/// Azure API key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Deserialize)]
struct TranscriptionBody {
    text: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Posts finalized utterances to an Azure OpenAI deployment.
pub struct AzureTranscriber {
    http: reqwest::Client,
    endpoint: Url,
    api_key: ApiKey,
}

impl AzureTranscriber {
    pub fn new(endpoint: Url, api_key: ApiKey) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("casabot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    /// `{endpoint}/openai/deployments/{model}/audio/transcriptions?api-version=..`
    pub fn transcription_url(&self, model: &str, api_version: &str) -> Result<Url, TranscribeError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| TranscribeError::Rejected(format!("invalid endpoint {}", self.endpoint)))?
            .pop_if_empty()
            .extend(["openai", "deployments", model, "audio", "transcriptions"]);
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }

    fn form(request: &TranscriptionRequest) -> Result<Form, TranscribeError> {
        let wav = encode_wav(request.audio(), request.format())
            .map_err(|e| TranscribeError::InvalidAudio(e.to_string()))?;
        let file = Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscribeError::InvalidAudio(e.to_string()))?;

        let mut form = Form::new()
            .part("file", file)
            .text("model", request.model().to_string())
            .text("response_format", "json");
        if let Some(language) = request.language() {
            form = form.text("language", language.to_string());
        }
        Ok(form)
    }
}

#[async_trait]
impl Transcriber for AzureTranscriber {
    async fn transcribe(&self, request: &TranscriptionRequest) -> TranscriptionResult {
        let url = self.transcription_url(request.model(), request.api_version())?;
        let form = Self::form(request)?;
        debug!(
            model = request.model(),
            language = request.language().unwrap_or("auto"),
            audio_bytes = request.audio().len(),
            "Posting transcription request"
        );

        let response = self
            .http
            .post(url)
            .header("api-key", self.api_key.expose())
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(classify_status(status, &headers, &body));
        }

        let parsed: TranscriptionBody = serde_json::from_slice(&body)
            .map_err(|e| TranscribeError::MalformedResponse(e.to_string()))?;
        Ok(parsed.text.trim().to_string())
    }
}

fn transport_error(e: reqwest::Error) -> TranscribeError {
    if e.is_timeout() {
        TranscribeError::Timeout
    } else {
        TranscribeError::Network(e.to_string())
    }
}

/// Map a non-success response to a transcription error.
pub(crate) fn classify_status(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> TranscribeError {
    let message = error_message(status, body);
    match status.as_u16() {
        401 | 403 => TranscribeError::Authentication(message),
        404 => TranscribeError::ModelNotFound(message),
        429 => TranscribeError::RateLimited {
            retry_after: retry_after(headers),
        },
        408 | 500..=599 => TranscribeError::Network(format!("HTTP {}: {message}", status.as_u16())),
        _ => TranscribeError::Rejected(format!("HTTP {}: {message}", status.as_u16())),
    }
}

fn error_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(ErrorBody { error }) = serde_json::from_slice::<ErrorBody>(body) {
        match (error.code, error.message) {
            (Some(code), Some(message)) => return format!("{code}: {message}"),
            (None, Some(message)) => return message,
            (Some(code), None) => return code,
            (None, None) => {}
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return status.canonical_reason().unwrap_or("unknown error").to_string();
    }
    text.chars().take(MAX_ERROR_TEXT).collect()
}

/// `retry-after-ms` wins over `Retry-After` (whole seconds). Values too large
/// for a `Duration` saturate; the retry policy caps them anyway.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
    };
    let seconds = |secs: f64| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
    header("retry-after-ms")
        .map(|ms| seconds(ms / 1000.0))
        .or_else(|| header("retry-after").map(seconds))
}
