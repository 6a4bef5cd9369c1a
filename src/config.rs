use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::session::state::{DEFAULT_RAW_LINE_CAP, MAX_RAW_LINE_CAP};

pub const CONFIG_FILE: &str = "relay.toml";

/// Env var that turns on tool-input previews.
pub const LOG_TOOL_INPUT_ENV: &str = "SWITCH_LOG_TOOL_INPUT";

/// Reasoning effort requested from the engine.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Reasoning {
    #[default]
    Normal,
    High,
}

/// Project-level relay configuration from `relay.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine used when the command line doesn't name one.
    pub engine: String,
    pub model: Option<String>,
    pub reasoning: Reasoning,
    /// OpenCode agent profile.
    pub agent: String,
    pub log_tool_input: bool,
    /// Non-JSON lines kept for the fallback diagnostic.
    pub raw_line_cap: usize,
    pub opencode: OpenCodeConfig,
    pub ralph: RalphSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: "claude".to_string(),
            model: None,
            reasoning: Reasoning::Normal,
            agent: "bridge".to_string(),
            log_tool_input: false,
            raw_line_cap: DEFAULT_RAW_LINE_CAP,
            opencode: OpenCodeConfig::default(),
            ralph: RalphSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenCodeConfig {
    /// Server base URL. `OPENCODE_SERVER_*` env vars take precedence.
    pub server_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub http_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub question_timeout_secs: u64,
}

impl Default for OpenCodeConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            username: None,
            password: None,
            http_timeout_secs: 30,
            idle_timeout_secs: 5,
            question_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RalphSection {
    /// Handlebars template for iterations after the first.
    pub continuation_template: Option<String>,
}

impl Config {
    /// Whether tool-input previews are enabled, from config or environment.
    pub fn tool_input_enabled(&self, env: impl Fn(&str) -> Option<String>) -> bool {
        self.log_tool_input || env(LOG_TOOL_INPUT_ENV).is_some_and(|v| is_truthy(&v))
    }

    pub fn raw_line_cap(&self) -> usize {
        self.raw_line_cap.clamp(1, MAX_RAW_LINE_CAP)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.opencode.idle_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.opencode.http_timeout_secs)
    }

    pub fn question_timeout(&self) -> Duration {
        Duration::from_secs(self.opencode.question_timeout_secs)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Load configuration from `relay.toml` in `dir`.
///
/// Falls back to defaults if the file is missing.
pub fn load(dir: &Path) -> Result<Config> {
    load_file(&dir.join(CONFIG_FILE))
}

/// Load configuration from an explicit path, falling back to defaults if it is missing.
pub fn load_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("invalid {}", path.display()))?;
    Ok(config)
}
