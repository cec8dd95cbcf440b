//! Capabilities advertised in reply to `describe`.

use crate::session::AUTO_LANGUAGE;
use casabot_proto::{AsrModel, AsrProgram, Attribution, Info};

pub const PROGRAM_NAME: &str = "casabot-azure-openai";
const PROGRAM_DESCRIPTION: &str = "Azure OpenAI speech-to-text via Wyoming Protocol";

/// Describe the single ASR program backed by the configured deployment.
pub fn describe(model: &str, language: Option<&str>) -> Info {
    let version = Some(env!("CARGO_PKG_VERSION").to_string());
    let languages = vec![language.unwrap_or(AUTO_LANGUAGE).to_string()];

    Info {
        asr: vec![AsrProgram {
            name: PROGRAM_NAME.to_string(),
            description: Some(PROGRAM_DESCRIPTION.to_string()),
            attribution: Attribution {
                name: "Azure OpenAI".to_string(),
                url: "https://azure.microsoft.com/en-us/products/ai-services/openai-service"
                    .to_string(),
            },
            installed: true,
            version: version.clone(),
            models: vec![AsrModel {
                name: model.to_string(),
                description: Some(format!("Azure OpenAI {model} model")),
                attribution: Attribution {
                    name: "OpenAI".to_string(),
                    url: "https://openai.com/".to_string(),
                },
                installed: true,
                languages,
                version,
            }],
        }],
    }
}
