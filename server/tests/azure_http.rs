//! Azure backend against an in-process HTTP fake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use casabot_proto::AudioFormat;
use casabot_server::transcribe::{
    ApiKey, AzureTranscriber, RetryPolicy, TranscribeError, Transcriber, TranscriptionClient,
    TranscriptionRequest,
};
use reqwest::Url;

const API_KEY: &str = "test-key-0123456789";

const FORMAT: AudioFormat = AudioFormat {
    rate: 16000,
    width: 2,
    channels: 1,
};

/// What the fake saw for one request.
#[derive(Debug, Clone, Default)]
struct Captured {
    model: String,
    api_version: Option<String>,
    api_key: Option<String>,
    fields: HashMap<String, String>,
    file_name: Option<String>,
    content_type: Option<String>,
    file: Vec<u8>,
}

struct Reply {
    status: u16,
    headers: Vec<(&'static str, &'static str)>,
    body: &'static str,
}

struct Fake {
    reply: Reply,
    captured: Mutex<Vec<Captured>>,
}

async fn transcriptions(
    State(fake): State<Arc<Fake>>,
    Path(model): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut captured = Captured {
        model,
        api_version: query.get("api-version").cloned(),
        api_key: headers
            .get("api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ..Captured::default()
    };
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            captured.file_name = field.file_name().map(str::to_string);
            captured.content_type = field.content_type().map(str::to_string);
            captured.file = field.bytes().await.unwrap().to_vec();
        } else {
            let value = field.text().await.unwrap();
            captured.fields.insert(name, value);
        }
    }
    fake.captured.lock().unwrap().push(captured);

    let mut response = (
        StatusCode::from_u16(fake.reply.status).unwrap(),
        fake.reply.body,
    )
        .into_response();
    for &(name, value) in &fake.reply.headers {
        response.headers_mut().insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    response
}

/// Serve `reply` for every request; returns the endpoint URL.
async fn start_fake(reply: Reply) -> (Url, Arc<Fake>) {
    let fake = Arc::new(Fake {
        reply,
        captured: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route(
            "/openai/deployments/{model}/audio/transcriptions",
            post(transcriptions),
        )
        .with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (Url::parse(&format!("http://{addr}/")).unwrap(), fake)
}

fn reply(status: u16, body: &'static str) -> Reply {
    Reply {
        status,
        headers: Vec::new(),
        body,
    }
}

fn request(language: Option<&str>) -> TranscriptionRequest {
    TranscriptionRequest::new(
        vec![0; 800],
        FORMAT,
        language.map(str::to_string),
        "whisper-1",
        "2024-02-01",
    )
}

async fn transcribe_with(
    reply: Reply,
    language: Option<&str>,
) -> (Result<String, TranscribeError>, Arc<Fake>) {
    let (endpoint, fake) = start_fake(reply).await;
    let backend = AzureTranscriber::new(endpoint, ApiKey::new(API_KEY)).unwrap();
    let result = backend.transcribe(&request(language)).await;
    (result, fake)
}

#[tokio::test]
async fn test_successful_transcription_request_shape() {
    let (result, fake) =
        transcribe_with(reply(200, r#"{"text":"  turn on the lights \n"}"#), None).await;
    assert_eq!(result.unwrap(), "turn on the lights");

    let captured = fake.captured.lock().unwrap().clone();
    assert_eq!(captured.len(), 1);
    let seen = &captured[0];
    assert_eq!(seen.model, "whisper-1");
    assert_eq!(seen.api_version.as_deref(), Some("2024-02-01"));
    assert_eq!(seen.api_key.as_deref(), Some(API_KEY));
    assert_eq!(seen.fields.get("model").map(String::as_str), Some("whisper-1"));
    assert_eq!(
        seen.fields.get("response_format").map(String::as_str),
        Some("json")
    );
    assert!(!seen.fields.contains_key("language"));
    assert_eq!(seen.file_name.as_deref(), Some("audio.wav"));
    assert_eq!(seen.content_type.as_deref(), Some("audio/wav"));
    assert_eq!(seen.file.len(), 44 + 800);
    assert_eq!(&seen.file[..4], b"RIFF");
}

#[tokio::test]
async fn test_language_hint_sent() {
    let (result, fake) = transcribe_with(reply(200, r#"{"text":"hallo"}"#), Some("de")).await;
    assert_eq!(result.unwrap(), "hallo");

    let captured = fake.captured.lock().unwrap().clone();
    assert_eq!(
        captured[0].fields.get("language").map(String::as_str),
        Some("de")
    );
}

#[tokio::test]
async fn test_error_statuses_classified() {
    let (result, _) = transcribe_with(
        reply(
            401,
            r#"{"error":{"code":"401","message":"Access denied due to invalid subscription key"}}"#,
        ),
        None,
    )
    .await;
    match result {
        Err(TranscribeError::Authentication(message)) => {
            assert!(message.contains("invalid subscription key"), "{message}");
        }
        other => panic!("expected authentication error, got {other:?}"),
    }

    let (result, _) = transcribe_with(
        reply(404, r#"{"error":{"code":"DeploymentNotFound"}}"#),
        None,
    )
    .await;
    assert!(matches!(result, Err(TranscribeError::ModelNotFound(_))));

    let (result, _) = transcribe_with(reply(500, "internal"), None).await;
    assert!(matches!(result, Err(TranscribeError::Network(_))));

    let (result, _) = transcribe_with(reply(400, "bad audio"), None).await;
    assert!(matches!(result, Err(TranscribeError::Rejected(_))));
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let (result, _) = transcribe_with(
        Reply {
            status: 429,
            headers: vec![("retry-after", "3")],
            body: "",
        },
        None,
    )
    .await;
    assert_eq!(
        result,
        Err(TranscribeError::RateLimited {
            retry_after: Some(Duration::from_secs(3))
        })
    );
}

#[tokio::test]
async fn test_malformed_success_body() {
    let (result, _) = transcribe_with(reply(200, "not json"), None).await;
    assert!(matches!(result, Err(TranscribeError::MalformedResponse(_))));

    let (result, _) = transcribe_with(reply(200, r#"{"words":[]}"#), None).await;
    assert!(matches!(result, Err(TranscribeError::MalformedResponse(_))));
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let endpoint = Url::parse(&format!("http://{addr}/")).unwrap();
    let backend = AzureTranscriber::new(endpoint, ApiKey::new(API_KEY)).unwrap();
    let result = backend.transcribe(&request(None)).await;
    assert!(matches!(result, Err(TranscribeError::Network(_))), "{result:?}");
}

#[tokio::test]
async fn test_client_retries_server_errors() {
    let (endpoint, fake) = start_fake(reply(503, "busy")).await;
    let backend = AzureTranscriber::new(endpoint, ApiKey::new(API_KEY)).unwrap();
    let retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    };
    let client = TranscriptionClient::new(Arc::new(backend), retry, Duration::from_secs(5));

    let result = client.transcribe(&request(None)).await;
    assert!(matches!(result, Err(TranscribeError::Network(_))));
    assert_eq!(fake.captured.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_client_does_not_retry_auth_failures() {
    let (endpoint, fake) = start_fake(reply(403, "forbidden")).await;
    let backend = AzureTranscriber::new(endpoint, ApiKey::new(API_KEY)).unwrap();
    let client = TranscriptionClient::new(
        Arc::new(backend),
        RetryPolicy::default(),
        Duration::from_secs(5),
    );

    let result = client.transcribe(&request(None)).await;
    assert!(matches!(result, Err(TranscribeError::Authentication(_))));
    assert_eq!(fake.captured.lock().unwrap().len(), 1);
}
