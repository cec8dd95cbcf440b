//! Server runner that wires the components together.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::info::describe;
use crate::server::Server;
use crate::socket::Listener;
use crate::transcribe::{AzureTranscriber, TranscriptionClient};

/// Run until SIGINT or SIGTERM.
pub async fn run(settings: Settings) -> Result<()> {
    info!("Starting CasaBot Wyoming Protocol Server");
    info!(uri = %settings.uri, "Wyoming URI");
    info!(endpoint = %settings.endpoint, "Azure OpenAI endpoint");
    info!(
        model = %settings.model,
        language = settings.language.as_deref().unwrap_or("auto"),
        api_version = %settings.api_version,
        "Transcription model"
    );

    let backend = AzureTranscriber::new(settings.endpoint.clone(), settings.api_key.clone())?;
    let client = TranscriptionClient::new(Arc::new(backend), settings.retry, settings.timeout);
    let server = Arc::new(Server::new(
        settings.session_config(),
        describe(&settings.model, settings.language.as_deref()),
        client,
    ));

    let listener = Listener::bind(&settings.uri).await?;
    let bound = listener.local_uri().context("Failed to read bound address")?;
    info!(uri = %bound, "Listening");

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    server.serve(&listener, shutdown).await;

    listener.cleanup();
    info!("Server stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            None
        }
    };
    let sigterm = async {
        match terminate.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupt received, shutting down"),
        _ = sigterm => info!("Terminate received, shutting down"),
    }
    shutdown.cancel();
}
