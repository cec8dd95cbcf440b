//! Wyoming protocol server.
//!
//! Every connection gets two tasks: a reader that frames inbound events into
//! a queue, and a processor that applies them to the connection's
//! [`Session`] in arrival order and owns the write half. The processor runs
//! remote calls inline and keeps answering the queue while one is pending,
//! so events that arrive mid-call see the session awaiting its result.
//!
//! A clean end of stream only closes the queue: a client that half-closes
//! after `audio-stop` still gets its transcript. A broken stream cancels the
//! connection token, which aborts a pending call.

use crate::error::ErrorCode;
use crate::registry::{ConnectionId, SessionRegistry, SharedSession};
use crate::session::{Outcome, Session, SessionConfig};
use crate::socket::Listener;
use crate::transcribe::{TranscriptionClient, TranscriptionRequest, TranscriptionResult};
use casabot_proto::{
    ErrorEvent, Event, EventReader, EventWriter, FrameError, FrameLimits, Info, Message, Pong,
    Transcript, Transport,
};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

/// Events read ahead of the processor before the reader waits.
const INBOUND_QUEUE: usize = 64;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type Writer = EventWriter<WriteHalf<Box<dyn Transport>>>;

enum Inbound {
    Event(Event),
    /// A bad frame that left the stream on a frame boundary.
    Invalid(FrameError),
    /// A bad frame after which the stream cannot be trusted.
    Fatal(FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Accepts connections and bridges them to the transcription client.
pub struct Server {
    session_config: Arc<SessionConfig>,
    info: Info,
    client: Arc<TranscriptionClient>,
    registry: Arc<SessionRegistry>,
    limits: FrameLimits,
    next_id: AtomicU64,
}

impl Server {
    pub fn new(session_config: SessionConfig, info: Info, client: TranscriptionClient) -> Self {
        Self {
            session_config: Arc::new(session_config),
            info,
            client: Arc::new(client),
            registry: Arc::new(SessionRegistry::new()),
            limits: FrameLimits::default(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Override the inbound frame size limits.
    pub fn with_limits(mut self, limits: FrameLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Accept connections until `shutdown` fires, then wait for live
    /// connections to wind down.
    pub async fn serve(self: Arc<Self>, listener: &Listener, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
                        let server = self.clone();
                        let shutdown = shutdown.clone();
                        tracker.spawn(
                            async move { server.handle_connection(id, stream, &shutdown).await }
                                .instrument(info_span!("connection", id = %id)),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        tracker.close();
        if !tracker.is_empty() {
            info!(connections = tracker.len(), "Waiting for connections to close");
        }
        tracker.wait().await;
    }

    /// Serve one client until it disconnects or `shutdown` fires.
    pub async fn handle_connection(
        &self,
        id: ConnectionId,
        stream: Box<dyn Transport>,
        shutdown: &CancellationToken,
    ) {
        let session = Session::new(self.session_config.clone());
        let registration = match self.registry.open(id, session, shutdown).await {
            Ok(registration) => registration,
            Err(e) => {
                error!(error = %e, "Failed to register connection");
                return;
            }
        };
        info!("Client connected");

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = EventReader::with_limits(BufReader::new(read_half), self.limits);
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let read_task = tokio::spawn(
            read_events(reader, tx, registration.cancel.clone()).in_current_span(),
        );

        let mut connection = Connection {
            server: self,
            id,
            session: registration.session,
            cancel: registration.cancel,
            writer: EventWriter::new(write_half),
        };
        if let Err(e) = connection.run(rx).await {
            debug!(error = %e, "Write failed");
        }

        // Teardown: drop the registry entry (cancelling the reader), release
        // any buffered audio and close our half of the stream.
        if let Some(session) = self.registry.close(id).await {
            session.lock().await.abort();
        }
        let _ = connection.writer.shutdown().await;
        let _ = read_task.await;
        info!("Client disconnected");
    }
}

/// Frame inbound events into the processor queue.
async fn read_events<R: AsyncBufRead + Unpin>(
    mut reader: EventReader<R>,
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = reader.read_event() => next,
        };
        let item = match next {
            Ok(Some(event)) => Inbound::Event(event),
            Ok(None) => {
                // Dropping `tx` lets the processor drain what is queued.
                debug!("Client closed its write side");
                return;
            }
            Err(FrameError::Io(e)) => {
                debug!(error = %e, "Read failed");
                break;
            }
            Err(FrameError::UnexpectedEof) => {
                debug!("Client disconnected mid-event");
                break;
            }
            Err(e) if e.is_recoverable() => Inbound::Invalid(e),
            Err(e) => {
                let _ = tx.send(Inbound::Fatal(e)).await;
                return;
            }
        };
        if tx.send(item).await.is_err() {
            return;
        }
    }
    cancel.cancel();
}

struct Connection<'a> {
    server: &'a Server,
    id: ConnectionId,
    session: SharedSession,
    cancel: CancellationToken,
    writer: Writer,
}

impl Connection<'_> {
    async fn run(&mut self, mut inbound: mpsc::Receiver<Inbound>) -> io::Result<()> {
        loop {
            // Queued events are handled before a cancellation is noticed.
            let item = tokio::select! {
                biased;
                item = inbound.recv() => item,
                _ = self.cancel.cancelled() => None,
            };
            let Some(item) = item else {
                return Ok(());
            };
            let flow = match item {
                Inbound::Event(event) => self.dispatch(event, &mut inbound).await?,
                item => self.reject(item).await?,
            };
            if flow == Flow::Stop {
                return Ok(());
            }
        }
    }

    async fn dispatch(
        &mut self,
        event: Event,
        inbound: &mut mpsc::Receiver<Inbound>,
    ) -> io::Result<Flow> {
        match self.apply(event).await? {
            None | Some(Outcome::Continue) => {}
            Some(Outcome::Transcript(text)) => {
                let mut session = self.session.lock().await;
                send_message(&mut self.writer, Message::Transcript(Transcript { text })).await?;
                session.reset();
            }
            Some(Outcome::Transcribe(request)) => return self.transcribe(request, inbound).await,
        }
        Ok(Flow::Continue)
    }

    /// Answer `event` or feed it to the session. Returns the session's
    /// outcome, or `None` when the event was answered or rejected here.
    async fn apply(&mut self, event: Event) -> io::Result<Option<Outcome>> {
        let message = match Message::from_event(event) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Undecodable event");
                self.send_error(ErrorCode::Protocol, e.to_string()).await?;
                return Ok(None);
            }
        };
        trace!(event = message.event_type(), "Received event");

        let outcome = match message {
            Message::Describe(_) => {
                self.send(Message::Info(self.server.info.clone())).await?;
                return Ok(None);
            }
            Message::Ping(ping) => {
                self.send(Message::Pong(Pong { text: ping.text })).await?;
                return Ok(None);
            }
            Message::Transcribe(request) => self
                .session
                .lock()
                .await
                .set_language(request.language)
                .map(|()| Outcome::Continue),
            Message::AudioStart(start) => self
                .session
                .lock()
                .await
                .start(start.format)
                .map(|()| Outcome::Continue),
            Message::AudioChunk(chunk) => self
                .session
                .lock()
                .await
                .push_audio(chunk.format, chunk.audio),
            Message::AudioStop(_) => self.session.lock().await.stop(),
            other => {
                let text = format!("unexpected {} event from client", other.event_type());
                warn!(event = other.event_type(), "Unexpected event");
                self.send_error(ErrorCode::Protocol, text).await?;
                return Ok(None);
            }
        };

        match outcome {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                warn!(error = %e, "Rejected event");
                self.send_error(ErrorCode::Protocol, e.to_string()).await?;
                Ok(None)
            }
        }
    }

    /// Report a bad frame. A frame the stream cannot recover from ends the
    /// connection.
    async fn reject(&mut self, item: Inbound) -> io::Result<Flow> {
        match item {
            Inbound::Event(_) => Ok(Flow::Continue),
            Inbound::Invalid(e) => {
                warn!(error = %e, "Malformed event");
                self.send_error(ErrorCode::Protocol, e.to_string()).await?;
                Ok(Flow::Continue)
            }
            Inbound::Fatal(e) => {
                warn!(error = %e, "Unrecoverable framing error, closing connection");
                self.send_error(ErrorCode::Protocol, e.to_string()).await?;
                Ok(Flow::Stop)
            }
        }
    }

    async fn transcribe(
        &mut self,
        request: TranscriptionRequest,
        inbound: &mut mpsc::Receiver<Inbound>,
    ) -> io::Result<Flow> {
        info!(
            audio_bytes = request.audio().len(),
            language = request.language().unwrap_or("auto"),
            "Transcribing utterance"
        );
        let server = self.server;
        let call = server.client.transcribe(&request);
        tokio::pin!(call);

        let mut input_open = true;
        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Connection closing, abandoning transcription");
                    self.session.lock().await.abort();
                    return Ok(Flow::Stop);
                }
                result = &mut call => break result,
                item = inbound.recv(), if input_open => {
                    let flow = match item {
                        // Half-closed; the result can still be written.
                        None => {
                            input_open = false;
                            Flow::Continue
                        }
                        Some(Inbound::Event(event)) => {
                            // The session is awaiting a result, so no event
                            // can start another call.
                            if let Some(outcome) = self.apply(event).await?
                                && outcome != Outcome::Continue
                            {
                                warn!(?outcome, "Ignoring outcome while awaiting result");
                            }
                            Flow::Continue
                        }
                        Some(item) => self.reject(item).await?,
                    };
                    if flow == Flow::Stop {
                        self.session.lock().await.abort();
                        return Ok(Flow::Stop);
                    }
                }
            }
        };
        deliver_result(&self.server.registry, self.id, &mut self.writer, result).await?;
        Ok(Flow::Continue)
    }

    async fn send(&mut self, message: Message) -> io::Result<()> {
        send_message(&mut self.writer, message).await
    }

    async fn send_error(&mut self, code: ErrorCode, text: String) -> io::Result<()> {
        send_message(&mut self.writer, error_message(code, text)).await
    }
}

/// Emit a finished transcription on its connection.
///
/// Returns `false` when the result was discarded because the connection's
/// session is gone or no longer waiting for it.
pub(crate) async fn deliver_result<W: AsyncWrite + Unpin>(
    registry: &SessionRegistry,
    id: ConnectionId,
    writer: &mut EventWriter<W>,
    result: TranscriptionResult,
) -> io::Result<bool> {
    let Some(session) = registry.get(id).await else {
        debug!(connection = %id, "Discarding result for closed connection");
        return Ok(false);
    };
    let mut session = session.lock().await;
    if !session.complete(&result) {
        debug!(connection = %id, state = %session.state(), "Discarding unexpected result");
        return Ok(false);
    }

    let message = match result {
        Ok(text) => {
            info!(chars = text.len(), "Transcription complete");
            Message::Transcript(Transcript { text })
        }
        Err(e) => error_message((&e).into(), format!("Transcription failed: {e}")),
    };
    send_message(writer, message).await?;
    session.reset();
    Ok(true)
}

fn error_message(code: ErrorCode, text: String) -> Message {
    Message::Error(ErrorEvent {
        text,
        code: Some(code.as_str().to_string()),
    })
}

async fn send_message<W: AsyncWrite + Unpin>(
    writer: &mut EventWriter<W>,
    message: Message,
) -> io::Result<()> {
    trace!(event = message.event_type(), "Sending event");
    writer.write_event(&message.into_event()).await
}

#[cfg(test)]
#[path = "server_test.rs"]
mod tests;
