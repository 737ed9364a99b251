use std::path::Path;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use url::Url;

/// Where finished bracket results are delivered.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultSink {
    /// Store the result as a message row in the parent conversation
    #[default]
    Database,
    /// POST the result as JSON to an external chat service
    Webhook { url: String },
    /// Post into the parent Discord channel
    Discord,
}

/// Json struct for deployment settings
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    pub web_port: Option<u16>,
    pub database_busy_timeout_secs: Option<u64>,
    pub database_max_connections: Option<u32>,
    pub discord_token: Option<String>,
    pub discord_command_channel: Option<String>,
    pub result_sink: Option<ResultSink>,
}

impl Settings {
    pub fn load(file: &Path) -> anyhow::Result<Self> {
        let settings: Settings = serde_json::from_str(&std::fs::read_to_string(file)?)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self.result_sink() {
            ResultSink::Webhook { url } => {
                let parsed = Url::parse(&url)?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(anyhow!("Result webhook must be http(s), got '{}'", url));
                }
            }
            ResultSink::Discord if self.discord_token.is_none() => {
                return Err(anyhow!("Discord result sink needs 'discord_token'"));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn result_sink(&self) -> ResultSink {
        self.result_sink.clone().unwrap_or_default()
    }
}
