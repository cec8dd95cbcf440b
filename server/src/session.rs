//! Per-connection utterance state machine.
//!
//! A [`Session`] owns the audio of the utterance in progress. Buffer
//! ownership moves with the stage: chunks accumulate while `Receiving`, are
//! frozen into one payload when `Finalizing` and leave the session as a
//! [`TranscriptionRequest`] once it is `AwaitingResult`.

use crate::buffer::AudioBuffer;
use crate::transcribe::{TranscriptionRequest, TranscriptionResult};
use casabot_proto::AudioFormat;
use std::fmt;
use std::mem;
use std::sync::Arc;
use tracing::{debug, warn};

/// Language value meaning "let the service detect it".
pub const AUTO_LANGUAGE: &str = "auto";

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Receiving,
    Finalizing,
    AwaitingResult,
    Completed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Receiving => "receiving",
            SessionState::Finalizing => "finalizing",
            SessionState::AwaitingResult => "awaiting-result",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only settings shared by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_buffer_bytes: usize,
    pub model: String,
    pub api_version: String,
    /// Default language hint, `None` for automatic detection.
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unexpected {event} while session is {state}")]
    OutOfOrder {
        event: &'static str,
        state: SessionState,
    },

    #[error("invalid audio format: {0}")]
    InvalidFormat(String),
}

/// What the caller must do after feeding an event to the session.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to send.
    Continue,
    /// Run this request and hand the result to [`Session::complete`].
    Transcribe(TranscriptionRequest),
    /// Send this transcript immediately; no remote call is needed.
    Transcript(String),
}

enum Stage {
    Idle,
    Receiving {
        format: AudioFormat,
        buffer: AudioBuffer,
        mismatch_logged: bool,
    },
    Finalizing {
        format: AudioFormat,
        audio: Vec<u8>,
    },
    AwaitingResult,
    Completed,
    Failed,
}

pub struct Session {
    config: Arc<SessionConfig>,
    stage: Stage,
    requested_language: Option<String>,
}

impl Session {
    pub fn new(config: Arc<SessionConfig>) -> Self {
        Self {
            config,
            stage: Stage::Idle,
            requested_language: None,
        }
    }

    pub fn state(&self) -> SessionState {
        match self.stage {
            Stage::Idle => SessionState::Idle,
            Stage::Receiving { .. } => SessionState::Receiving,
            Stage::Finalizing { .. } => SessionState::Finalizing,
            Stage::AwaitingResult => SessionState::AwaitingResult,
            Stage::Completed => SessionState::Completed,
            Stage::Failed => SessionState::Failed,
        }
    }

    /// Bytes accumulated for the utterance in progress.
    pub fn buffered_bytes(&self) -> usize {
        match &self.stage {
            Stage::Receiving { buffer, .. } => buffer.len(),
            Stage::Finalizing { audio, .. } => audio.len(),
            _ => 0,
        }
    }

    /// Effective language hint for the next request.
    pub fn language(&self) -> Option<String> {
        match self.requested_language.as_deref() {
            Some(AUTO_LANGUAGE) => None,
            Some(language) => Some(language.to_string()),
            None => self.config.language.clone(),
        }
    }

    /// Apply a `transcribe` request. The hint lasts until the utterance
    /// completes.
    pub fn set_language(&mut self, language: Option<String>) -> Result<(), SessionError> {
        self.ensure_not_busy("transcribe")?;
        self.requested_language = language.filter(|l| !l.trim().is_empty());
        Ok(())
    }

    /// Begin an utterance. A start while already receiving discards the
    /// partial utterance.
    pub fn start(&mut self, format: AudioFormat) -> Result<(), SessionError> {
        self.ensure_not_busy("audio-start")?;
        format.validate().map_err(SessionError::InvalidFormat)?;

        if let Stage::Receiving { buffer, .. } = &self.stage {
            warn!(
                discarded_bytes = buffer.len(),
                "audio-start while receiving, restarting utterance"
            );
        }
        debug!(
            rate = format.rate,
            width = format.width,
            channels = format.channels,
            "Utterance started"
        );
        self.stage = Stage::Receiving {
            format,
            buffer: AudioBuffer::new(self.config.max_buffer_bytes),
            mismatch_logged: false,
        };
        Ok(())
    }

    /// Append the audio of an `audio-chunk` event. The payload is always
    /// packaged with the format given at `audio-start`; a chunk declaring a
    /// different one is logged once per utterance.
    pub fn push_audio(
        &mut self,
        format: AudioFormat,
        audio: Vec<u8>,
    ) -> Result<Outcome, SessionError> {
        if let Stage::Receiving {
            format: declared,
            mismatch_logged,
            ..
        } = &mut self.stage
            && *declared != format
            && !*mismatch_logged
        {
            warn!(
                rate = format.rate,
                width = format.width,
                channels = format.channels,
                expected_rate = declared.rate,
                expected_width = declared.width,
                expected_channels = declared.channels,
                "audio-chunk format differs from audio-start"
            );
            *mismatch_logged = true;
        }
        self.push_chunk(audio)
    }

    /// Append a chunk. Hitting the size ceiling finalizes the utterance
    /// with what was buffered so far.
    pub fn push_chunk(&mut self, chunk: Vec<u8>) -> Result<Outcome, SessionError> {
        let Stage::Receiving { buffer, .. } = &mut self.stage else {
            return Err(self.out_of_order("audio-chunk"));
        };
        match buffer.push(chunk) {
            Ok(()) => Ok(Outcome::Continue),
            Err(full) => {
                warn!(
                    buffered = full.buffered,
                    chunk = full.chunk,
                    max_bytes = full.max_bytes,
                    "Audio buffer full, finalizing early"
                );
                self.finalize()?;
                Ok(self.begin_transcription())
            }
        }
    }

    /// End of the audio stream.
    pub fn stop(&mut self) -> Result<Outcome, SessionError> {
        self.finalize()?;
        Ok(self.begin_transcription())
    }

    /// Freeze the buffer. Only valid while receiving.
    fn finalize(&mut self) -> Result<(), SessionError> {
        match mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Receiving { format, buffer, .. } => {
                debug!(
                    bytes = buffer.len(),
                    chunks = buffer.chunk_count(),
                    "Finalizing utterance"
                );
                self.stage = Stage::Finalizing {
                    format,
                    audio: buffer.freeze(),
                };
                Ok(())
            }
            other => {
                self.stage = other;
                Err(self.out_of_order("audio-stop"))
            }
        }
    }

    /// Hand the frozen payload off. Silence completes at once.
    fn begin_transcription(&mut self) -> Outcome {
        let Stage::Finalizing { format, audio } = mem::replace(&mut self.stage, Stage::AwaitingResult)
        else {
            self.stage = Stage::Failed;
            return Outcome::Continue;
        };

        if audio.is_empty() {
            debug!("Empty utterance, skipping transcription");
            self.stage = Stage::Completed;
            return Outcome::Transcript(String::new());
        }

        Outcome::Transcribe(TranscriptionRequest::new(
            audio,
            format,
            self.language(),
            self.config.model.clone(),
            self.config.api_version.clone(),
        ))
    }

    /// Record the result of the in-flight request. Returns `false` when no
    /// request was outstanding.
    pub fn complete(&mut self, result: &TranscriptionResult) -> bool {
        if !matches!(self.stage, Stage::AwaitingResult) {
            return false;
        }
        self.stage = match result {
            Ok(_) => Stage::Completed,
            Err(_) => Stage::Failed,
        };
        true
    }

    /// Make a finished session ready for the next utterance.
    pub fn reset(&mut self) {
        if matches!(self.stage, Stage::Completed | Stage::Failed) {
            self.stage = Stage::Idle;
            self.requested_language = None;
        }
    }

    /// Tear down on disconnect, releasing any buffered audio.
    pub fn abort(&mut self) {
        if !matches!(self.stage, Stage::Idle | Stage::Completed | Stage::Failed) {
            debug!(state = %self.state(), "Aborting session");
        }
        self.stage = Stage::Failed;
    }

    fn ensure_not_busy(&self, event: &'static str) -> Result<(), SessionError> {
        match self.stage {
            Stage::Finalizing { .. } | Stage::AwaitingResult => Err(self.out_of_order(event)),
            _ => Ok(()),
        }
    }

    fn out_of_order(&self, event: &'static str) -> SessionError {
        SessionError::OutOfOrder {
            event,
            state: self.state(),
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
