//! Wyoming client for talking to a casabot server.

use anyhow::{Context, Result, bail};
use casabot_proto::{
    AudioChunk, AudioFormat, AudioStart, AudioStop, Describe, EventReader, EventWriter, Info,
    Message, Transcribe, Transport, WyomingUri,
};
use tokio::io::{BufReader, ReadHalf, WriteHalf};
use tracing::debug;

type Stream = Box<dyn Transport>;

/// One client connection, holding both directions of the stream.
pub struct WyomingClient {
    reader: EventReader<BufReader<ReadHalf<Stream>>>,
    writer: EventWriter<WriteHalf<Stream>>,
}

impl WyomingClient {
    /// Connect to a server at the given URI.
    pub async fn connect(uri: &WyomingUri) -> Result<Self> {
        let stream = uri
            .connect()
            .await
            .with_context(|| format!("Failed to connect to {uri}"))?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: Stream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: EventReader::new(BufReader::new(read_half)),
            writer: EventWriter::new(write_half),
        }
    }

    /// Send one message.
    pub async fn send(&mut self, message: Message) -> Result<()> {
        debug!(event = message.event_type(), "Sending event");
        self.writer
            .write_event(&message.into_event())
            .await
            .context("Failed to write event")
    }

    /// Receive the next message, or `None` once the server closes the stream.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        let Some(event) = self.reader.read_event().await? else {
            return Ok(None);
        };
        let message = Message::from_event(event)?;
        debug!(event = message.event_type(), "Received event");
        Ok(Some(message))
    }

    /// Ask the server to describe itself.
    pub async fn describe(&mut self) -> Result<Info> {
        self.send(Message::Describe(Describe {})).await?;
        loop {
            match self.recv().await? {
                Some(Message::Info(info)) => return Ok(info),
                Some(other) => debug!(event = other.event_type(), "Ignoring event"),
                None => bail!("Server closed the connection before sending info"),
            }
        }
    }

    /// Stream one utterance and wait for its transcript.
    ///
    /// `audio` is raw PCM in `format`, sent in slices of `chunk_size` bytes.
    pub async fn transcribe(
        &mut self,
        format: AudioFormat,
        audio: &[u8],
        chunk_size: usize,
        language: Option<String>,
    ) -> Result<String> {
        if language.is_some() {
            self.send(Message::Transcribe(Transcribe {
                name: None,
                language,
            }))
            .await?;
        }
        self.send(Message::AudioStart(AudioStart {
            format,
            timestamp: None,
        }))
        .await?;
        for slice in audio.chunks(chunk_size.max(1)) {
            self.send(Message::AudioChunk(AudioChunk {
                format,
                timestamp: None,
                audio: slice.to_vec(),
            }))
            .await?;
        }
        self.send(Message::AudioStop(AudioStop::default())).await?;

        loop {
            match self.recv().await? {
                Some(Message::Transcript(transcript)) => return Ok(transcript.text),
                Some(Message::Error(error)) => bail!(
                    "Server reported error [{}]: {}",
                    error.code.as_deref().unwrap_or("unknown"),
                    error.text
                ),
                Some(other) => debug!(event = other.event_type(), "Ignoring event"),
                None => bail!("Server closed the connection before sending a transcript"),
            }
        }
    }
}
