pub mod buffer;
pub mod config;
pub mod daemon;
pub mod error;
pub mod info;
pub mod registry;
pub mod server;
pub mod session;
pub mod socket;
pub mod transcribe;

use tracing::error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Application-specific environment variable for log filtering (overrides config).
const LOG_ENV_VAR: &str = "CASABOT_LOG";

/// Entry point for the server process: configures logging, validates the
/// configuration and runs the server.
pub async fn run() -> anyhow::Result<()> {
    let config = config::Config::load()?;

    // Container logs go to stdout.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());

    // CASABOT_LOG env var overrides the configured level
    let filter = EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(config.logging.level.as_directive().parse()?)
        .from_env()?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking))
        .with(filter)
        .init();

    let settings = match config.validate() {
        Ok(settings) => settings,
        Err(e) => {
            for problem in &e.problems {
                error!(problem = %problem, "Configuration error");
            }
            return Err(e.into());
        }
    };

    daemon::run(settings).await
}
