//! Event framing.
//!
//! Every event starts with one JSON header line. The header may carry the
//! event data inline (`data`), or declare a separate JSON data segment
//! (`data_length`) and a binary payload (`payload_length`) that follow the
//! newline, in that order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::PROTOCOL_VERSION;

/// A decoded event: type, merged JSON data and raw payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub data: Map<String, Value>,
    /// Binary payload; empty when the event carries none.
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

/// Header line as it appears on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

/// Upper bounds applied while reading a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_header_bytes: usize,
    pub max_data_bytes: usize,
    pub max_payload_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            max_data_bytes: 1024 * 1024,
            max_payload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Errors raised while reading a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid event header: {0}")]
    InvalidHeader(String),

    #[error("invalid event data: {0}")]
    InvalidData(String),

    #[error("event header exceeds {limit} bytes")]
    HeaderTooLong { limit: usize },

    #[error("{segment} of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        segment: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("connection closed in the middle of an event")]
    UnexpectedEof,
}

impl FrameError {
    /// Whether the stream is still positioned at a frame boundary, so the
    /// next event can be read after reporting this one.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::InvalidHeader(_) | FrameError::InvalidData(_))
    }
}

/// Reads framed events from a buffered byte stream.
pub struct EventReader<R> {
    inner: R,
    limits: FrameLimits,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> EventReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limits(inner, FrameLimits::default())
    }

    pub fn with_limits(inner: R, limits: FrameLimits) -> Self {
        Self {
            inner,
            limits,
            line: Vec::new(),
        }
    }

    /// Read the next event.
    ///
    /// Returns `Ok(None)` on a clean end of stream (no partial frame pending).
    pub async fn read_event(&mut self) -> Result<Option<Event>, FrameError> {
        let Some(header) = self.read_header().await? else {
            return Ok(None);
        };
        let limits = self.limits;

        let extra = match header.data_length.unwrap_or(0) {
            0 => Vec::new(),
            len => self.read_segment("data", len, limits.max_data_bytes).await?,
        };
        let payload = match header.payload_length.unwrap_or(0) {
            0 => Vec::new(),
            len => {
                self.read_segment("payload", len, limits.max_payload_bytes)
                    .await?
            }
        };

        // Parse the data segment only after the payload is consumed so a bad
        // segment leaves the stream on a frame boundary.
        let mut data = header.data.unwrap_or_default();
        if !extra.is_empty() {
            let extra: Map<String, Value> = serde_json::from_slice(&extra)
                .map_err(|e| FrameError::InvalidData(e.to_string()))?;
            data.extend(extra);
        }

        Ok(Some(Event {
            event_type: header.event_type,
            data,
            payload,
        }))
    }

    async fn read_header(&mut self) -> Result<Option<Header>, FrameError> {
        let limit = self.limits.max_header_bytes;
        loop {
            self.line.clear();
            let read = (&mut self.inner)
                .take(limit as u64)
                .read_until(b'\n', &mut self.line)
                .await?;
            if read == 0 {
                return Ok(None);
            }
            if self.line.last() != Some(&b'\n') {
                if read >= limit {
                    return Err(FrameError::HeaderTooLong { limit });
                }
                return Err(FrameError::UnexpectedEof);
            }

            let line = self.line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            return serde_json::from_slice(line)
                .map(Some)
                .map_err(|e| FrameError::InvalidHeader(e.to_string()));
        }
    }

    async fn read_segment(
        &mut self,
        segment: &'static str,
        size: usize,
        limit: usize,
    ) -> Result<Vec<u8>, FrameError> {
        if size > limit {
            return Err(FrameError::TooLarge {
                segment,
                size,
                limit,
            });
        }
        let mut buf = vec![0u8; size];
        match self.inner.read_exact(&mut buf).await {
            Ok(_) => Ok(buf),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::UnexpectedEof),
            Err(e) => Err(FrameError::Io(e)),
        }
    }
}

/// Writes framed events to a byte stream.
pub struct EventWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> EventWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Serialize and flush one event. Data goes into a separate segment.
    pub async fn write_event(&mut self, event: &Event) -> io::Result<()> {
        let data = if event.data.is_empty() {
            None
        } else {
            Some(serde_json::to_vec(&event.data)?)
        };
        let header = Header {
            event_type: event.event_type.clone(),
            data: None,
            data_length: data.as_ref().map(Vec::len),
            payload_length: (!event.payload.is_empty()).then_some(event.payload.len()),
            version: Some(PROTOCOL_VERSION.to_string()),
        };

        let mut frame = serde_json::to_vec(&header)?;
        frame.push(b'\n');
        if let Some(data) = data {
            frame.extend_from_slice(&data);
        }
        frame.extend_from_slice(&event.payload);

        self.inner.write_all(&frame).await?;
        self.inner.flush().await
    }

    /// Shut down the write direction of the underlying stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
