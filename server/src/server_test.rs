use super::*;
use crate::session::SessionState;
use crate::transcribe::{RetryPolicy, TranscribeError, Transcriber};
use async_trait::async_trait;
use casabot_common::client::WyomingClient;
use casabot_proto::{AudioChunk, AudioFormat, AudioStart, AudioStop, Ping};
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const FORMAT: AudioFormat = AudioFormat {
    rate: 16000,
    width: 2,
    channels: 1,
};

/// Records every request and answers with a fixed result. A held fake
/// answers only after `release` is notified.
struct FakeTranscriber {
    requests: StdMutex<Vec<TranscriptionRequest>>,
    reply: TranscriptionResult,
    called: Notify,
    release: Option<Notify>,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, request: &TranscriptionRequest) -> TranscriptionResult {
        self.requests.lock().unwrap().push(request.clone());
        self.called.notify_one();
        if let Some(release) = &self.release {
            release.notified().await;
        }
        self.reply.clone()
    }
}

impl FakeTranscriber {
    fn requests(&self) -> Vec<TranscriptionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

struct Harness {
    server: Arc<Server>,
    fake: Arc<FakeTranscriber>,
    shutdown: CancellationToken,
}

fn session_config() -> SessionConfig {
    SessionConfig {
        max_buffer_bytes: 4096,
        model: "whisper-1".to_string(),
        api_version: "2024-02-01".to_string(),
        language: None,
    }
}

fn harness(reply: TranscriptionResult) -> Harness {
    build_harness(reply, FrameLimits::default(), false)
}

fn harness_with_limits(reply: TranscriptionResult, limits: FrameLimits) -> Harness {
    build_harness(reply, limits, false)
}

/// A harness whose backend holds every call until released.
fn held_harness(reply: TranscriptionResult) -> Harness {
    build_harness(reply, FrameLimits::default(), true)
}

fn build_harness(reply: TranscriptionResult, limits: FrameLimits, held: bool) -> Harness {
    let fake = Arc::new(FakeTranscriber {
        requests: StdMutex::new(Vec::new()),
        reply,
        called: Notify::new(),
        release: held.then(Notify::new),
    });
    let client = TranscriptionClient::new(
        fake.clone(),
        RetryPolicy::default(),
        Duration::from_secs(5),
    );
    let server = Server::new(
        session_config(),
        crate::info::describe("whisper-1", None),
        client,
    )
    .with_limits(limits);
    Harness {
        server: Arc::new(server),
        fake,
        shutdown: CancellationToken::new(),
    }
}

impl Harness {
    fn spawn(&self, id: u64) -> (DuplexStream, JoinHandle<()>) {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let server = self.server.clone();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            server
                .handle_connection(ConnectionId(id), Box::new(server_side), &shutdown)
                .await
        });
        (client, task)
    }

    fn connect(&self, id: u64) -> (WyomingClient, JoinHandle<()>) {
        let (stream, task) = self.spawn(id);
        (WyomingClient::from_stream(Box::new(stream)), task)
    }
}

impl Harness {
    fn release(&self) {
        if let Some(release) = &self.fake.release {
            release.notify_one();
        }
    }
}

fn utterance(chunks: &[Vec<u8>]) -> Vec<Message> {
    let mut messages = vec![Message::AudioStart(AudioStart {
        format: FORMAT,
        timestamp: None,
    })];
    messages.extend(chunks.iter().map(|audio| {
        Message::AudioChunk(AudioChunk {
            format: FORMAT,
            timestamp: None,
            audio: audio.clone(),
        })
    }));
    messages.push(Message::AudioStop(AudioStop::default()));
    messages
}

async fn expect_error(client: &mut WyomingClient) -> ErrorEvent {
    match client.recv().await.unwrap() {
        Some(Message::Error(error)) => error,
        other => panic!("expected error event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_describe_returns_info() {
    let h = harness(Ok(String::new()));
    let (mut client, _task) = h.connect(1);

    let info = client.describe().await.unwrap();
    assert_eq!(info, crate::info::describe("whisper-1", None));
}

#[tokio::test]
async fn test_ping_pong() {
    let h = harness(Ok(String::new()));
    let (mut client, _task) = h.connect(1);

    client
        .send(Message::Ping(Ping {
            text: Some("hi".to_string()),
        }))
        .await
        .unwrap();
    assert_eq!(
        client.recv().await.unwrap(),
        Some(Message::Pong(Pong {
            text: Some("hi".to_string())
        }))
    );
}

#[tokio::test]
async fn test_utterance_transcribed() {
    let h = harness(Ok("turn on the lights".to_string()));
    let (mut client, _task) = h.connect(1);

    let audio: Vec<u8> = (0..800u32).map(|i| (i % 251) as u8).collect();
    let text = client
        .transcribe(FORMAT, &audio, 320, Some("de".to_string()))
        .await
        .unwrap();
    assert_eq!(text, "turn on the lights");

    let requests = h.fake.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].audio(), &audio[..]);
    assert_eq!(requests[0].format(), FORMAT);
    assert_eq!(requests[0].language(), Some("de"));

    let session = h.server.registry().get(ConnectionId(1)).await.unwrap();
    assert_eq!(session.lock().await.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_session_reused_for_next_utterance() {
    let h = harness(Ok("again".to_string()));
    let (mut client, _task) = h.connect(1);

    for _ in 0..3 {
        let text = client.transcribe(FORMAT, &[1; 64], 32, None).await.unwrap();
        assert_eq!(text, "again");
    }
    assert_eq!(h.fake.requests().len(), 3);
}

#[tokio::test]
async fn test_empty_utterance_skips_remote_call() {
    let h = harness(Ok("never".to_string()));
    let (mut client, _task) = h.connect(1);

    let text = client.transcribe(FORMAT, &[], 320, None).await.unwrap();
    assert_eq!(text, "");
    assert!(h.fake.requests().is_empty());
}

#[tokio::test]
async fn test_transcription_failure_reported_with_code() {
    let h = harness(Err(TranscribeError::Authentication("bad key".into())));
    let (mut client, _task) = h.connect(1);

    let err = client
        .transcribe(FORMAT, &[1; 100], 50, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("auth-failed"), "{err}");
    assert_eq!(h.fake.requests().len(), 1);

    let session = h.server.registry().get(ConnectionId(1)).await.unwrap();
    assert_eq!(session.lock().await.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_stop_without_start_is_protocol_error() {
    let h = harness(Ok("ok".to_string()));
    let (mut client, _task) = h.connect(1);

    client
        .send(Message::AudioStop(AudioStop::default()))
        .await
        .unwrap();
    let error = expect_error(&mut client).await;
    assert_eq!(error.code.as_deref(), Some("protocol-error"));
    assert!(h.fake.requests().is_empty());

    let session = h.server.registry().get(ConnectionId(1)).await.unwrap();
    assert_eq!(session.lock().await.state(), SessionState::Idle);

    // The connection is still usable.
    let text = client.transcribe(FORMAT, &[1; 10], 10, None).await.unwrap();
    assert_eq!(text, "ok");
}

#[tokio::test]
async fn test_server_only_event_rejected() {
    let h = harness(Ok(String::new()));
    let (mut client, _task) = h.connect(1);

    client
        .send(Message::Transcript(Transcript {
            text: "spoof".into(),
        }))
        .await
        .unwrap();
    let error = expect_error(&mut client).await;
    assert_eq!(error.code.as_deref(), Some("protocol-error"));
    assert!(error.text.contains("transcript"));
}

#[tokio::test]
async fn test_malformed_frames_are_recoverable() {
    let h = harness(Ok(String::new()));
    let (stream, _task) = h.spawn(1);
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = EventReader::new(BufReader::new(read_half));

    write_half.write_all(b"{not json}\n").await.unwrap();
    let event = reader.read_event().await.unwrap().unwrap();
    assert_eq!(event.event_type, "error");
    assert_eq!(event.data["code"], "protocol-error");

    write_half
        .write_all(b"{\"type\":\"frobnicate\"}\n")
        .await
        .unwrap();
    let event = reader.read_event().await.unwrap().unwrap();
    assert_eq!(event.event_type, "error");
    assert!(event.data["text"].as_str().unwrap().contains("frobnicate"));

    write_half
        .write_all(b"{\"type\":\"audio-start\",\"data\":{\"rate\":\"fast\"}}\n")
        .await
        .unwrap();
    let event = reader.read_event().await.unwrap().unwrap();
    assert_eq!(event.event_type, "error");

    write_half.write_all(b"{\"type\":\"ping\"}\n").await.unwrap();
    let event = reader.read_event().await.unwrap().unwrap();
    assert_eq!(event.event_type, "pong");
}

#[tokio::test]
async fn test_oversized_payload_closes_connection() {
    let limits = FrameLimits {
        max_payload_bytes: 16,
        ..FrameLimits::default()
    };
    let h = harness_with_limits(Ok(String::new()), limits);
    let (stream, task) = h.spawn(1);
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = EventReader::new(BufReader::new(read_half));

    write_half
        .write_all(b"{\"type\":\"audio-chunk\",\"payload_length\":1000}\n")
        .await
        .unwrap();
    let event = reader.read_event().await.unwrap().unwrap();
    assert_eq!(event.event_type, "error");
    assert_eq!(event.data["code"], "protocol-error");

    assert!(reader.read_event().await.unwrap().is_none());
    task.await.unwrap();
    assert!(h.server.registry().is_empty().await);
}

#[tokio::test]
async fn test_disconnect_removes_session() {
    let h = harness(Ok(String::new()));
    let (mut client, task) = h.connect(1);
    client.describe().await.unwrap();
    assert!(h.server.registry().contains(ConnectionId(1)).await);

    drop(client);
    task.await.unwrap();
    assert!(h.server.registry().is_empty().await);
}

#[tokio::test]
async fn test_half_closed_client_receives_transcript() {
    let h = held_harness(Ok("turn on the lights".to_string()));
    let (stream, task) = h.spawn(1);
    let (read_half, write_half) = tokio::io::split(stream);
    let mut writer = EventWriter::new(write_half);
    let mut reader = EventReader::new(BufReader::new(read_half));

    for message in utterance(&[vec![4; 320]]) {
        writer.write_event(&message.into_event()).await.unwrap();
    }
    writer.shutdown().await.unwrap();
    h.fake.called.notified().await;
    h.release();

    let event = reader.read_event().await.unwrap().unwrap();
    assert_eq!(
        Message::from_event(event).unwrap(),
        Message::Transcript(Transcript {
            text: "turn on the lights".to_string()
        })
    );
    assert!(reader.read_event().await.unwrap().is_none());
    task.await.unwrap();
    assert_eq!(h.fake.requests().len(), 1);
    assert!(h.server.registry().is_empty().await);
}

#[tokio::test]
async fn test_events_during_pending_call_see_awaiting_result() {
    let h = held_harness(Ok("done".to_string()));
    let (mut client, _task) = h.connect(1);

    for message in utterance(&[vec![1; 320]]) {
        client.send(message).await.unwrap();
    }
    h.fake.called.notified().await;

    client
        .send(Message::AudioChunk(AudioChunk {
            format: FORMAT,
            timestamp: None,
            audio: vec![2; 160],
        }))
        .await
        .unwrap();
    let error = expect_error(&mut client).await;
    assert_eq!(error.code.as_deref(), Some("protocol-error"));
    assert!(error.text.contains("awaiting-result"), "{}", error.text);

    client
        .send(Message::Ping(Ping { text: None }))
        .await
        .unwrap();
    assert_eq!(
        client.recv().await.unwrap(),
        Some(Message::Pong(Pong { text: None }))
    );

    h.release();
    assert_eq!(
        client.recv().await.unwrap(),
        Some(Message::Transcript(Transcript {
            text: "done".to_string()
        }))
    );
    let requests = h.fake.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].audio(), &[1u8; 320][..]);
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let h = harness(Ok(String::new()));
    let (mut client, task) = h.connect(1);
    client.describe().await.unwrap();

    h.shutdown.cancel();
    task.await.unwrap();
    assert!(client.recv().await.unwrap().is_none());
    assert!(h.server.registry().is_empty().await);
}

#[tokio::test]
async fn test_result_for_closed_connection_discarded() {
    let registry = SessionRegistry::new();
    let (client, server_side) = tokio::io::duplex(1024);
    let mut writer = EventWriter::new(server_side);

    let delivered = deliver_result(&registry, ConnectionId(9), &mut writer, Ok("late".into()))
        .await
        .unwrap();
    assert!(!delivered);

    drop(writer);
    let mut reader = EventReader::new(BufReader::new(client));
    assert!(reader.read_event().await.unwrap().is_none());
}

#[tokio::test]
async fn test_result_for_idle_session_discarded() {
    let registry = SessionRegistry::new();
    let root = CancellationToken::new();
    registry
        .open(ConnectionId(1), Session::new(Arc::new(session_config())), &root)
        .await
        .unwrap();
    let (_client, server_side) = tokio::io::duplex(1024);
    let mut writer = EventWriter::new(server_side);

    let delivered = deliver_result(&registry, ConnectionId(1), &mut writer, Ok("late".into()))
        .await
        .unwrap();
    assert!(!delivered);
}

#[tokio::test]
async fn test_result_delivered_to_waiting_session() {
    let registry = SessionRegistry::new();
    let root = CancellationToken::new();
    let registration = registry
        .open(ConnectionId(1), Session::new(Arc::new(session_config())), &root)
        .await
        .unwrap();
    {
        let mut session = registration.session.lock().await;
        session.start(FORMAT).unwrap();
        session.push_chunk(vec![1; 10]).unwrap();
        assert!(matches!(session.stop().unwrap(), Outcome::Transcribe(_)));
    }

    let (client, server_side) = tokio::io::duplex(1024);
    let mut writer = EventWriter::new(server_side);
    let delivered = deliver_result(
        &registry,
        ConnectionId(1),
        &mut writer,
        Err(TranscribeError::RateLimited { retry_after: None }),
    )
    .await
    .unwrap();
    assert!(delivered);
    assert_eq!(
        registration.session.lock().await.state(),
        SessionState::Idle
    );

    let mut reader = EventReader::new(BufReader::new(client));
    let event = reader.read_event().await.unwrap().unwrap();
    assert_eq!(event.event_type, "error");
    assert_eq!(event.data["code"], "rate-limited");
}
