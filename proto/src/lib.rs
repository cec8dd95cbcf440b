//! Wyoming protocol definitions for casabot.
//!
//! A Wyoming message is a single JSON header line, optionally followed by a
//! JSON data segment and a raw binary payload whose lengths the header
//! declares. [`event`] handles the framing, [`message`] the typed events
//! exchanged between the bridge and its clients, and [`uri`] the endpoint
//! addresses both sides agree on.

pub mod event;
pub mod message;
pub mod uri;

pub use event::{Event, EventReader, EventWriter, FrameError, FrameLimits};
pub use message::{
    AsrModel, AsrProgram, Attribution, AudioChunk, AudioFormat, AudioStart, AudioStop,
    DecodeError, Describe, ErrorEvent, Info, Message, Ping, Pong, Transcribe, Transcript,
};
pub use uri::{Transport, WyomingUri};

/// Wyoming protocol version advertised in outgoing headers.
pub const PROTOCOL_VERSION: &str = "1.5.2";
