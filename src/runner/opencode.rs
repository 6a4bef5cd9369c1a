use std::path::PathBuf;
use std::sync::Arc;

use super::stream::{CancelSlot, RunStream};
use super::{Engine, EngineOptions, Runner, prompt_preview};
use crate::RunnerError;
use crate::config::Reasoning;
use crate::normalize::OpenCodeNormalizer;
use crate::protocol::emit::{MessageBody, ModelRef};
use crate::transport::client::OpenCodeClient;
use crate::transport::line_stream::{LineCommand, LineStreamDriver};
use crate::transport::service_stream::{ServiceRequest, ServiceStreamDriver};

/// Talks to a running OpenCode server over HTTP + SSE. Questions raised by
/// the agent go to the configured callback.
pub struct OpenCodeRunner {
    session_name: Option<String>,
    model: Option<ModelRef>,
    agent: String,
    driver: ServiceStreamDriver,
    cancel: CancelSlot,
}

impl OpenCodeRunner {
    pub fn new(options: EngineOptions) -> Result<Self, RunnerError> {
        let client = OpenCodeClient::new(options.server)?;
        Ok(Self {
            session_name: options.session_name,
            model: options
                .model
                .as_deref()
                .and_then(|m| ModelRef::parse(m, options.reasoning)),
            agent: options.agent,
            driver: ServiceStreamDriver {
                client,
                normalizer: Arc::new(OpenCodeNormalizer::new(options.tool_format)),
                question_callback: options.question_callback,
            },
            cancel: CancelSlot::default(),
        })
    }

    pub fn message_body(&self, prompt: &str) -> MessageBody {
        MessageBody::new(prompt, self.model.clone(), Some(&self.agent))
    }
}

impl Runner for OpenCodeRunner {
    fn engine(&self) -> Engine {
        Engine::OpenCode
    }

    fn run(&self, prompt: &str, continuation_id: Option<&str>) -> RunStream {
        tracing::info!(engine = "opencode", prompt = %prompt_preview(prompt), "starting run");
        let token = self.cancel.begin();
        let request = ServiceRequest {
            continuation_id: continuation_id.map(str::to_string),
            title: self.session_name.clone(),
            message: self.message_body(prompt),
        };
        self.driver.start(request, token)
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Runs `opencode run --format json` as a subprocess.
pub struct OpenCodeCliRunner {
    program: PathBuf,
    model: Option<String>,
    reasoning: Reasoning,
    agent: String,
    working_dir: Option<PathBuf>,
    driver: LineStreamDriver,
    cancel: CancelSlot,
}

impl OpenCodeCliRunner {
    pub fn new(options: EngineOptions) -> Self {
        let normalizer = Arc::new(OpenCodeNormalizer::new(options.tool_format));
        Self {
            program: options.binary.unwrap_or_else(|| PathBuf::from("opencode")),
            model: options.model,
            reasoning: options.reasoning,
            agent: options.agent,
            working_dir: options.working_dir,
            driver: LineStreamDriver::new("OpenCode", normalizer, options.raw_line_cap),
            cancel: CancelSlot::default(),
        }
    }

    /// Build the opencode CLI arguments. The prompt always follows `--`.
    pub fn build_args(&self, prompt: &str, continuation_id: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--format".to_string(),
            "json".to_string(),
            "--agent".to_string(),
            self.agent.clone(),
        ];
        if let Some(id) = continuation_id {
            args.push("--session".to_string());
            args.push(id.to_string());
        }
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if self.reasoning == Reasoning::High {
            args.push("--variant".to_string());
            args.push("high".to_string());
        }
        args.push("--".to_string());
        args.push(prompt.to_string());
        args
    }
}

impl Runner for OpenCodeCliRunner {
    fn engine(&self) -> Engine {
        Engine::OpenCodeCli
    }

    fn run(&self, prompt: &str, continuation_id: Option<&str>) -> RunStream {
        tracing::info!(engine = "opencode-cli", prompt = %prompt_preview(prompt), "starting run");
        let token = self.cancel.begin();
        let command = LineCommand {
            program: self.program.clone(),
            args: self.build_args(prompt, continuation_id),
            working_dir: self.working_dir.clone(),
        };
        self.driver.start(command, token)
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
