//! Typed Wyoming events understood by the bridge.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::Event;

/// PCM layout declared by `audio-start` and repeated on each `audio-chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Samples per second.
    pub rate: u32,
    /// Bytes per sample.
    pub width: u16,
    pub channels: u16,
}

impl AudioFormat {
    /// Bytes occupied by one frame (one sample for every channel).
    pub fn frame_bytes(&self) -> usize {
        usize::from(self.width) * usize::from(self.channels)
    }

    /// Check the format describes PCM the bridge can package.
    pub fn validate(&self) -> Result<(), String> {
        if self.rate == 0 {
            return Err("sample rate must be positive".to_string());
        }
        if self.channels == 0 {
            return Err("channel count must be positive".to_string());
        }
        if !(1..=4).contains(&self.width) {
            return Err(format!("unsupported sample width: {} bytes", self.width));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Describe {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsrModel {
    pub name: String,
    pub description: Option<String>,
    pub attribution: Attribution,
    pub installed: bool,
    pub languages: Vec<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsrProgram {
    pub name: String,
    pub description: Option<String>,
    pub attribution: Attribution,
    pub installed: bool,
    pub version: Option<String>,
    pub models: Vec<AsrModel>,
}

/// Capabilities description sent in reply to `describe`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    #[serde(default)]
    pub asr: Vec<AsrProgram>,
}

/// Request to transcribe the next audio stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcribe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStart {
    #[serde(flatten)]
    pub format: AudioFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// One slice of PCM audio. The samples travel as the event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioChunk {
    #[serde(flatten)]
    pub format: AudioFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip)]
    pub audio: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStop {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
}

/// Error reported to a client. `text` is the human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Errors converting a framed [`Event`] into a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("invalid {event_type} event: {reason}")]
    InvalidData { event_type: String, reason: String },
}

/// Every event type the bridge sends or receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Describe(Describe),
    Info(Info),
    Transcribe(Transcribe),
    AudioStart(AudioStart),
    AudioChunk(AudioChunk),
    AudioStop(AudioStop),
    Transcript(Transcript),
    Error(ErrorEvent),
    Ping(Ping),
    Pong(Pong),
}

impl Message {
    /// Wire name of the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Message::Describe(_) => "describe",
            Message::Info(_) => "info",
            Message::Transcribe(_) => "transcribe",
            Message::AudioStart(_) => "audio-start",
            Message::AudioChunk(_) => "audio-chunk",
            Message::AudioStop(_) => "audio-stop",
            Message::Transcript(_) => "transcript",
            Message::Error(_) => "error",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
        }
    }

    /// Decode a framed event.
    pub fn from_event(event: Event) -> Result<Self, DecodeError> {
        let Event {
            event_type,
            data,
            payload,
        } = event;

        let message = match event_type.as_str() {
            "describe" => Message::Describe(parse(&event_type, data)?),
            "info" => Message::Info(parse(&event_type, data)?),
            "transcribe" => Message::Transcribe(parse(&event_type, data)?),
            "audio-start" => Message::AudioStart(parse(&event_type, data)?),
            "audio-chunk" => {
                let mut chunk: AudioChunk = parse(&event_type, data)?;
                chunk.audio = payload;
                Message::AudioChunk(chunk)
            }
            "audio-stop" => Message::AudioStop(parse(&event_type, data)?),
            "transcript" => Message::Transcript(parse(&event_type, data)?),
            "error" => Message::Error(parse(&event_type, data)?),
            "ping" => Message::Ping(parse(&event_type, data)?),
            "pong" => Message::Pong(parse(&event_type, data)?),
            _ => return Err(DecodeError::UnknownType(event_type)),
        };
        Ok(message)
    }

    /// Encode into a framed event.
    pub fn into_event(self) -> Event {
        let event = Event::new(self.event_type());
        match self {
            Message::Describe(m) => event.with_data(to_map(&m)),
            Message::Info(m) => event.with_data(to_map(&m)),
            Message::Transcribe(m) => event.with_data(to_map(&m)),
            Message::AudioStart(m) => event.with_data(to_map(&m)),
            Message::AudioChunk(m) => event.with_data(to_map(&m)).with_payload(m.audio),
            Message::AudioStop(m) => event.with_data(to_map(&m)),
            Message::Transcript(m) => event.with_data(to_map(&m)),
            Message::Error(m) => event.with_data(to_map(&m)),
            Message::Ping(m) => event.with_data(to_map(&m)),
            Message::Pong(m) => event.with_data(to_map(&m)),
        }
    }
}

impl From<Message> for Event {
    fn from(message: Message) -> Self {
        message.into_event()
    }
}

fn parse<T: DeserializeOwned>(event_type: &str, data: Map<String, Value>) -> Result<T, DecodeError> {
    serde_json::from_value(Value::Object(data)).map_err(|e| DecodeError::InvalidData {
        event_type: event_type.to_string(),
        reason: e.to_string(),
    })
}

fn to_map<T: Serialize>(value: &T) -> Map<String, Value> {
    // Every message type serializes to a JSON object.
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
