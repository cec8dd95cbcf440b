//! `casabotctl`: query and exercise a casabot server over Wyoming.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use casabot_common::client::WyomingClient;
use casabot_proto::WyomingUri;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod wav;

const DEFAULT_URI: &str = "tcp://127.0.0.1:10300";

#[derive(Parser)]
#[command(name = "casabotctl")]
#[command(about = "CasaBot CLI - talk to a Wyoming speech-to-text server")]
#[command(version)]
struct Cli {
    /// Server address: tcp://host:port or unix://path
    #[arg(long, global = true, env = "WYOMING_URI", default_value = DEFAULT_URI)]
    uri: WyomingUri,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the server's capabilities
    Describe {
        /// Print the raw info event data as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stream a WAV file to the server and print the transcript
    Transcribe {
        /// PCM WAV file
        file: PathBuf,

        /// Bytes of audio per audio-chunk event
        #[arg(long, default_value_t = 1024)]
        chunk_size: usize,

        /// Language hint, e.g. "en" (server default if omitted)
        #[arg(long)]
        language: Option<String>,
    },
}

/// Entry point for the CLI process.
pub async fn run() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Describe { json } => describe(&cli.uri, json).await,
        Commands::Transcribe {
            file,
            chunk_size,
            language,
        } => transcribe(&cli.uri, &file, chunk_size, language).await,
    }
}

async fn describe(uri: &WyomingUri, json: bool) -> Result<()> {
    let mut client = WyomingClient::connect(uri).await?;
    let info = client.describe().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }
    for program in &info.asr {
        println!(
            "{} {}",
            program.name,
            program.version.as_deref().unwrap_or("")
        );
        if let Some(description) = &program.description {
            println!("  {description}");
        }
        for model in &program.models {
            println!(
                "  model: {} (languages: {})",
                model.name,
                model.languages.join(", ")
            );
        }
    }
    Ok(())
}

async fn transcribe(
    uri: &WyomingUri,
    file: &Path,
    chunk_size: usize,
    language: Option<String>,
) -> Result<()> {
    let (format, audio) = wav::read_pcm(file)?;
    info!(
        path = %file.display(),
        rate = format.rate,
        width = format.width,
        channels = format.channels,
        bytes = audio.len(),
        "Loaded audio"
    );

    let mut client = WyomingClient::connect(uri).await?;
    let text = client
        .transcribe(format, &audio, chunk_size, language)
        .await
        .with_context(|| format!("Failed to transcribe {}", file.display()))?;
    println!("{text}");
    Ok(())
}
