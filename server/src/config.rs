//! Configuration for the casabot server.
//!
//! Values are layered: built-in defaults, then the TOML file, then the
//! environment variables used by the add-on packaging. [`Config::validate`]
//! turns the raw layers into immutable [`Settings`].

use crate::session::{AUTO_LANGUAGE, SessionConfig};
use crate::transcribe::{ApiKey, RetryPolicy};
use anyhow::{Context, Result};
use casabot_proto::WyomingUri;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "CASABOT_CONFIG";

const MIN_API_KEY_LEN: usize = 10;

/// Main configuration struct for the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub azure: AzureConfig,
    pub transcription: TranscriptionConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Azure OpenAI resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// Resource endpoint, e.g. `https://name.openai.azure.com/`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub api_version: String,
}

/// Model and request policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Deployment name, e.g. "whisper-1" or "gpt-audio".
    pub model: String,
    /// Default language hint, "auto" for detection.
    pub language: String,
    /// Hard deadline for one remote call.
    pub timeout_secs: u64,
    /// Attempts per utterance, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `tcp://host:port` or `unix://path`.
    pub uri: String,
    /// Audio ceiling per utterance; reaching it finalizes early.
    pub max_buffer_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub level: LogLevel,
}

/// Log verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to a tracing filter directive string for the server crate.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "casabot_server=error",
            LogLevel::Warn => "casabot_server=warn",
            LogLevel::Info => "casabot_server=info",
            LogLevel::Debug => "casabot_server=debug",
            LogLevel::Trace => "casabot_server=trace",
        }
    }
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            api_version: "2024-02-01".to_string(),
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model: "whisper-1".to_string(),
            language: AUTO_LANGUAGE.to_string(),
            timeout_secs: 30,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            uri: "tcp://0.0.0.0:10300".to_string(),
            max_buffer_bytes: 24 * 1024 * 1024,
        }
    }
}

/// Every problem found by [`Config::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration: {}", .problems.join("; "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

/// Validated, immutable runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub endpoint: Url,
    pub api_key: ApiKey,
    pub api_version: String,
    pub model: String,
    /// `None` for automatic detection.
    pub language: Option<String>,
    pub uri: WyomingUri,
    pub max_buffer_bytes: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Settings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_buffer_bytes: self.max_buffer_bytes,
            model: self.model.clone(),
            api_version: self.api_version.clone(),
            language: self.language.clone(),
        }
    }
}

impl Config {
    /// Config file path: `$CASABOT_CONFIG`, else
    /// `~/.config/casabot/config.toml`.
    pub fn config_path() -> Result<PathBuf> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => casabot_common::dirs::config_path(),
        }
    }

    /// Load the config file (defaults if absent) and apply the process
    /// environment on top.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file as TOML")
    }

    /// Overlay environment variables. Empty values count as unset.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = var("AZURE_OPENAI_ENDPOINT") {
            self.azure.endpoint = Some(v);
        }
        if let Some(v) = var("AZURE_OPENAI_API_KEY") {
            self.azure.api_key = Some(v);
        }
        if let Some(v) = var("AZURE_OPENAI_API_VERSION") {
            self.azure.api_version = v;
        }
        if let Some(v) = var("MODEL") {
            self.transcription.model = v;
        }
        if let Some(v) = var("LANGUAGE") {
            self.transcription.language = v;
        }
        if let Some(v) = var("WYOMING_URI") {
            self.server.uri = v;
        }
        if var("DEBUG").is_some_and(|v| is_truthy(&v)) {
            self.logging.level = LogLevel::Debug;
        }
    }

    /// Check every setting, reporting all problems at once.
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let mut problems: Vec<String> = Vec::new();

        let endpoint = match self.azure.endpoint.as_deref() {
            None => {
                problems.push("Azure OpenAI endpoint is required (AZURE_OPENAI_ENDPOINT)".into());
                None
            }
            Some(raw) => match parse_endpoint(raw) {
                Ok(url) => Some(url),
                Err(reason) => {
                    problems.push(format!("Invalid Azure OpenAI endpoint {raw:?}: {reason}"));
                    None
                }
            },
        };

        let api_key = match self.azure.api_key.as_deref().map(str::trim) {
            None | Some("") => {
                problems.push("Azure OpenAI API key is required (AZURE_OPENAI_API_KEY)".into());
                None
            }
            Some(key) if key.chars().count() < MIN_API_KEY_LEN => {
                problems.push(format!(
                    "Azure OpenAI API key is too short (at least {MIN_API_KEY_LEN} characters)"
                ));
                None
            }
            Some(key) => Some(ApiKey::new(key)),
        };

        if !is_api_version(&self.azure.api_version) {
            problems.push(format!(
                "Invalid API version format: {:?}",
                self.azure.api_version
            ));
        }

        let model = self.transcription.model.trim();
        if model.is_empty() {
            problems.push("Model name cannot be empty".into());
        }

        let language = self.transcription.language.trim();
        if language != AUTO_LANGUAGE && !is_language_code(language) {
            problems.push(format!("Invalid language code: {language:?}"));
        }

        let uri = match self.server.uri.parse::<WyomingUri>() {
            Ok(uri) => Some(uri),
            Err(e) => {
                problems.push(e.to_string());
                None
            }
        };

        let t = &self.transcription;
        if t.timeout_secs == 0 {
            problems.push("timeout_secs must be positive".into());
        }
        if t.max_attempts == 0 {
            problems.push("max_attempts must be at least 1".into());
        }
        if t.initial_backoff_ms > t.max_backoff_ms {
            problems.push("initial_backoff_ms must not exceed max_backoff_ms".into());
        }
        if self.server.max_buffer_bytes == 0 {
            problems.push("max_buffer_bytes must be positive".into());
        }

        match (endpoint, api_key, uri) {
            (Some(endpoint), Some(api_key), Some(uri)) if problems.is_empty() => Ok(Settings {
                endpoint,
                api_key,
                api_version: self.azure.api_version.clone(),
                model: model.to_string(),
                language: (language != AUTO_LANGUAGE).then(|| language.to_string()),
                uri,
                max_buffer_bytes: self.server.max_buffer_bytes,
                timeout: Duration::from_secs(t.timeout_secs),
                retry: RetryPolicy {
                    max_attempts: t.max_attempts,
                    initial_backoff: Duration::from_millis(t.initial_backoff_ms),
                    max_backoff: Duration::from_millis(t.max_backoff_ms),
                },
            }),
            _ => Err(ConfigError { problems }),
        }
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| e.to_string())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err("scheme must be http or https".into());
    }
    let Some(host) = url.host_str() else {
        return Err("missing host".into());
    };
    if !host.ends_with(".openai.azure.com") {
        warn!(endpoint = raw, "Endpoint doesn't appear to be an Azure OpenAI endpoint");
    }
    Ok(url)
}

/// `ll`, `lll`, optionally followed by `-CC`.
fn is_language_code(code: &str) -> bool {
    let (lang, region) = match code.split_once('-') {
        Some((lang, region)) => (lang, Some(region)),
        None => (code, None),
    };
    let lang_ok = (2..=3).contains(&lang.len()) && lang.bytes().all(|b| b.is_ascii_lowercase());
    let region_ok =
        region.is_none_or(|r| r.len() == 2 && r.bytes().all(|b| b.is_ascii_uppercase()));
    lang_ok && region_ok
}

/// Dated version string, e.g. `2024-02-01` or `2024-10-01-preview`.
fn is_api_version(version: &str) -> bool {
    let bytes = version.as_bytes();
    bytes.len() >= 10
        && bytes[..10].iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
