//! The engine-agnostic [`Runner`] interface and the engine registry.

pub mod claude;
pub mod opencode;
pub mod stream;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::RunnerError;
use crate::config::{Config, Reasoning};
use crate::display::tool_format::ToolFormat;
use crate::event::{Answers, Question};
use crate::session::state::DEFAULT_RAW_LINE_CAP;
use crate::transport::client::ServerSettings;

pub use claude::ClaudeRunner;
pub use opencode::{OpenCodeCliRunner, OpenCodeRunner};
pub use stream::{CancelHandle, CancelSlot, CancelToken, RunSink, RunStream, cancel_pair};

/// Answers a question on behalf of the user. An error rejects the question.
pub type QuestionCallback =
    Arc<dyn Fn(Question) -> BoxFuture<'static, anyhow::Result<Answers>> + Send + Sync>;

/// One concrete coding agent.
///
/// `run` starts the agent and returns immediately; the returned stream is
/// driven by a background task and can only be consumed once. `cancel` may be
/// called from any task, any number of times, before or during a run.
pub trait Runner: Send + Sync {
    fn engine(&self) -> Engine;

    /// Must be called within a tokio runtime.
    fn run(&self, prompt: &str, continuation_id: Option<&str>) -> RunStream;

    fn cancel(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Claude,
    OpenCode,
    OpenCodeCli,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::Claude, Engine::OpenCode, Engine::OpenCodeCli];

    /// Parse an engine name or alias, ignoring case and surrounding whitespace.
    pub fn parse(name: &str) -> Result<Self, RunnerError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "claude" | "cc" => Ok(Engine::Claude),
            "opencode" | "oc" => Ok(Engine::OpenCode),
            "opencode-cli" => Ok(Engine::OpenCodeCli),
            _ => Err(RunnerError::UnknownEngine(name.trim().to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Claude => "claude",
            Engine::OpenCode => "opencode",
            Engine::OpenCodeCli => "opencode-cli",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-engine settings, fixed when a runner is constructed.
#[derive(Clone)]
pub struct EngineOptions {
    pub working_dir: Option<PathBuf>,
    /// Logical session name, used as the OpenCode session title.
    pub session_name: Option<String>,
    pub model: Option<String>,
    pub reasoning: Reasoning,
    /// OpenCode agent profile.
    pub agent: String,
    pub tool_format: ToolFormat,
    pub raw_line_cap: usize,
    pub server: ServerSettings,
    pub question_callback: Option<QuestionCallback>,
    /// Override the agent executable (defaults to `claude` / `opencode`).
    pub binary: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            working_dir: None,
            session_name: None,
            model: None,
            reasoning: Reasoning::Normal,
            agent: "bridge".to_string(),
            tool_format: ToolFormat::default(),
            raw_line_cap: DEFAULT_RAW_LINE_CAP,
            server: ServerSettings::default(),
            question_callback: None,
            binary: None,
        }
    }
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("working_dir", &self.working_dir)
            .field("session_name", &self.session_name)
            .field("model", &self.model)
            .field("reasoning", &self.reasoning)
            .field("agent", &self.agent)
            .field("server", &self.server.base_url)
            .field("question_callback", &self.question_callback.is_some())
            .finish_non_exhaustive()
    }
}

impl EngineOptions {
    /// Build options from the config file, with environment overrides.
    pub fn from_config(config: &Config, env: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            model: config.model.clone().filter(|m| !m.trim().is_empty()),
            reasoning: config.reasoning,
            agent: config.agent.clone(),
            tool_format: ToolFormat {
                include_input: config.tool_input_enabled(&env),
                ..ToolFormat::default()
            },
            raw_line_cap: config.raw_line_cap(),
            server: ServerSettings::resolve(&config.opencode, &env),
            ..Self::default()
        }
    }
}

/// Construct the runner registered under `name`.
///
/// ```no_run
/// # async fn demo() -> Result<(), relay::RunnerError> {
/// use relay::runner::{EngineOptions, create_runner};
///
/// let runner = create_runner("claude", EngineOptions::default())?;
/// let (events, summary) = runner.run("list the files", None).collect().await;
/// # Ok(())
/// # }
/// ```
pub fn create_runner(name: &str, options: EngineOptions) -> Result<Arc<dyn Runner>, RunnerError> {
    Ok(match Engine::parse(name)? {
        Engine::Claude => Arc::new(ClaudeRunner::new(options)),
        Engine::OpenCode => Arc::new(OpenCodeRunner::new(options)?),
        Engine::OpenCodeCli => Arc::new(OpenCodeCliRunner::new(options)),
    })
}

/// First 50 characters of a prompt, for logs.
pub(crate) fn prompt_preview(prompt: &str) -> String {
    let preview: String = prompt.chars().take(50).collect();
    if preview.len() < prompt.len() {
        format!("{preview}...")
    } else {
        preview
    }
}
