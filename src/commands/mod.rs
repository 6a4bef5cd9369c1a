use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;

use crate::config::{self, Config, Reasoning};
use crate::event::{Answers, Question, QuestionItem};
use crate::runner::{EngineOptions, QuestionCallback};

pub mod ralph;
pub mod run;
pub mod status;

/// Directory, relative to the working directory, holding loop status files.
pub const LOOP_DIR: &str = ".relay/loops";
/// Session name used when none is given.
pub const DEFAULT_SESSION: &str = "default";

/// Options shared by every command that starts an agent.
#[derive(Debug, Clone, Default)]
pub struct AgentArgs {
    pub engine: Option<String>,
    pub model: Option<String>,
    pub reasoning: Option<Reasoning>,
    pub config_path: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl AgentArgs {
    /// Load the config file, from `--config` or the working directory.
    pub fn load_config(&self) -> Result<Config> {
        match &self.config_path {
            Some(path) => config::load_file(path),
            None => {
                let dir = match &self.working_dir {
                    Some(dir) => dir.clone(),
                    None => std::env::current_dir()?,
                };
                config::load(&dir)
            }
        }
    }

    /// Engine name, flags first.
    pub fn engine<'a>(&'a self, config: &'a Config) -> &'a str {
        self.engine.as_deref().unwrap_or(&config.engine)
    }

    /// Engine options from config, environment and flags, in increasing precedence.
    pub fn engine_options(&self, config: &Config) -> EngineOptions {
        let mut options = EngineOptions::from_config(config, |key| std::env::var(key).ok());
        if let Some(model) = &self.model {
            options.model = Some(model.clone());
        }
        if let Some(reasoning) = self.reasoning {
            options.reasoning = reasoning;
        }
        options.working_dir.clone_from(&self.working_dir);
        options
    }
}

/// Loop status directory under `base`.
pub fn loop_dir(base: &Path) -> PathBuf {
    base.join(LOOP_DIR)
}

/// Answer questions from stdin. The question itself has already been
/// rendered; each item gets one input line.
pub fn stdin_question_callback() -> QuestionCallback {
    Arc::new(|question: Question| {
        tokio::task::spawn_blocking(move || {
            let stdin = std::io::stdin();
            let mut input = stdin.lock();
            let mut stderr = std::io::stderr();
            read_answers(&question, &mut input, &mut stderr)
        })
        .map(|joined| match joined {
            Ok(answers) => answers,
            Err(e) => Err(anyhow::anyhow!("question prompt task failed: {e}")),
        })
        .boxed()
    })
}

/// Read one answer per question item.
pub fn read_answers(
    question: &Question,
    input: &mut impl BufRead,
    prompt: &mut impl Write,
) -> Result<Answers> {
    let mut answers = Vec::with_capacity(question.items.len());
    for item in &question.items {
        match item.options.first() {
            Some(default) => write!(prompt, "answer [{}]: ", default.label)?,
            None => write!(prompt, "answer: ")?,
        }
        prompt.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            anyhow::bail!("stdin closed before question {} was answered", question.request_id);
        }
        answers.push(parse_answer(item, &line));
    }
    Ok(answers)
}

/// Interpret one input line: empty takes the first option, a number picks
/// an option, anything else is a free-form answer.
pub fn parse_answer(item: &QuestionItem, line: &str) -> Vec<String> {
    let line = line.trim();
    if line.is_empty() {
        return item
            .options
            .first()
            .map(|o| vec![o.label.clone()])
            .unwrap_or_default();
    }
    if let Ok(index) = line.parse::<usize>()
        && let Some(option) = index.checked_sub(1).and_then(|i| item.options.get(i))
    {
        return vec![option.label.clone()];
    }
    vec![line.to_string()]
}
