use std::path::PathBuf;
use std::sync::Arc;

use super::stream::{CancelSlot, RunStream};
use super::{Engine, EngineOptions, Runner, prompt_preview};
use crate::normalize::ClaudeNormalizer;
use crate::transport::line_stream::{LineCommand, LineStreamDriver};

const DEFAULT_MODEL: &str = "opus";

/// Runs `claude -p` with stream-json output.
pub struct ClaudeRunner {
    program: PathBuf,
    model: String,
    working_dir: Option<PathBuf>,
    driver: LineStreamDriver,
    cancel: CancelSlot,
}

impl ClaudeRunner {
    pub fn new(options: EngineOptions) -> Self {
        let normalizer = Arc::new(ClaudeNormalizer::new(options.tool_format));
        Self {
            program: options.binary.unwrap_or_else(|| PathBuf::from("claude")),
            model: options.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            working_dir: options.working_dir,
            driver: LineStreamDriver::new("Claude", normalizer, options.raw_line_cap),
            cancel: CancelSlot::default(),
        }
    }

    /// Build the claude CLI arguments.
    pub fn build_args(&self, prompt: &str, continuation_id: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if let Some(id) = continuation_id {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }
        args
    }
}

impl Runner for ClaudeRunner {
    fn engine(&self) -> Engine {
        Engine::Claude
    }

    fn run(&self, prompt: &str, continuation_id: Option<&str>) -> RunStream {
        tracing::info!(engine = "claude", prompt = %prompt_preview(prompt), "starting run");
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
