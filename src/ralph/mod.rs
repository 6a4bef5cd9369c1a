//! The Ralph loop: re-invoke an agent until it declares completion, the
//! iteration budget runs out, or someone cancels.

pub mod store;

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::event::{Event, Failure, FailureKind, RunSummary};
use crate::runner::Runner;

pub use store::{FileLoopStore, LoopStore, MemoryLoopStore, SessionClaim};

/// Characters of the previous iteration's text offered to the next one.
const PREVIOUS_OUTPUT_CHARS: usize = 4000;
const CONTINUATION_TEMPLATE_NAME: &str = "continuation";

const DEFAULT_CONTINUATION_TEMPLATE: &str = "\
Continue working on this task (iteration {{iteration}}):

{{prompt}}

Your previous iteration ended with:

{{previous_output}}{{#if completion_phrase}}

When the task is fully done, include the exact phrase \"{{completion_phrase}}\" in your reply.{{/if}}";

#[derive(Debug, Clone, Default)]
pub struct RalphConfig {
    /// Logical session the loop belongs to.
    pub session: String,
    pub prompt: String,
    /// 0 means unlimited.
    pub max_iterations: u32,
    pub completion_phrase: Option<String>,
    /// Handlebars template overriding the built-in continuation prompt.
    pub continuation_template: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Running,
    Cancelling,
    Completed,
    Cancelled,
    Failed,
}

impl LoopStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopStatus::Completed | LoopStatus::Cancelled | LoopStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoopStatus::Running => "running",
            LoopStatus::Cancelling => "cancelling",
            LoopStatus::Completed => "completed",
            LoopStatus::Cancelled => "cancelled",
            LoopStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BudgetExhausted,
    CompletionPhrase,
    Cancelled,
    FatalError,
}

/// Point-in-time copy of a loop's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSnapshot {
    pub session: String,
    pub prompt: String,
    pub status: LoopStatus,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub completion_phrase: Option<String>,
    pub total_cost: f64,
    pub failures: u32,
    pub last_error: Option<String>,
    pub stop_reason: Option<StopReason>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoopSnapshot {
    pub fn new(
        session: impl Into<String>,
        prompt: impl Into<String>,
        max_iterations: u32,
        completion_phrase: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session: session.into(),
            prompt: prompt.into(),
            status: LoopStatus::Running,
            current_iteration: 0,
            max_iterations,
            completion_phrase,
            total_cost: 0.0,
            failures: 0,
            last_error: None,
            stop_reason: None,
            started_at: now,
            updated_at: now,
        }
    }

    fn budget_label(&self) -> String {
        if self.max_iterations == 0 {
            "unlimited".to_string()
        } else {
            self.max_iterations.to_string()
        }
    }

    fn budget_exhausted(&self) -> bool {
        self.max_iterations > 0 && self.current_iteration >= self.max_iterations
    }

    /// Human-readable status, as shown by `relay status`.
    pub fn status_line(&self) -> String {
        if self.status.is_terminal() {
            format!(
                "Last Ralph: {}\nIterations: {}/{}\nCost: ${:.3}",
                self.status,
                self.current_iteration,
                self.budget_label(),
                self.total_cost
            )
        } else {
            format!(
                "Ralph {}\nIteration: {}/{}\nCost so far: ${:.3}\nPromise: {}",
                self.status.as_str().to_uppercase(),
                self.current_iteration,
                self.budget_label(),
                self.total_cost,
                self.completion_phrase.as_deref().unwrap_or("none")
            )
        }
    }
}

/// Something a loop reports while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutput {
    IterationStarted { iteration: u32, max_iterations: u32 },
    Event(Event),
    IterationFinished { iteration: u32, summary: RunSummary },
    Finished(LoopSnapshot),
}

/// Receives live loop output.
pub trait OutputSink {
    fn deliver(&mut self, output: LoopOutput);
}

impl OutputSink for Vec<LoopOutput> {
    fn deliver(&mut self, output: LoopOutput) {
        self.push(output);
    }
}

struct Shared {
    snapshot: RwLock<LoopSnapshot>,
    runner: Arc<dyn Runner>,
}

/// Read and cancel a loop from other tasks.
#[derive(Clone)]
pub struct LoopHandle(Arc<Shared>);

impl LoopHandle {
    pub fn snapshot(&self) -> LoopSnapshot {
        self.0
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> LoopStatus {
        self.0
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    /// Request cancellation. Takes effect once the current iteration has
    /// drained. No-op unless the loop is running.
    pub fn cancel(&self) {
        {
            let mut snapshot = self
                .0
                .snapshot
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if snapshot.status != LoopStatus::Running {
                return;
            }
            snapshot.status = LoopStatus::Cancelling;
            snapshot.updated_at = Utc::now();
        }
        tracing::info!("cancelling Ralph loop");
        self.0.runner.cancel();
    }

    fn update(&self, f: impl FnOnce(&mut LoopSnapshot)) -> LoopSnapshot {
        let mut snapshot = self
            .0
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut snapshot);
        snapshot.updated_at = Utc::now();
        snapshot.clone()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LoopHandle").field(&self.snapshot()).finish()
    }
}

/// How one iteration ended.
#[derive(Default)]
struct IterationOutcome {
    result_text: Option<String>,
    failure: Option<Failure>,
    summary: RunSummary,
}

pub struct RalphLoop {
    runner: Arc<dyn Runner>,
    store: Arc<dyn LoopStore>,
    templates: Handlebars<'static>,
    handle: LoopHandle,
}

impl RalphLoop {
    /// Set up a loop in the `running` state. Fails if the continuation
    /// template does not parse.
    pub fn new(
        config: RalphConfig,
        runner: Arc<dyn Runner>,
        store: Arc<dyn LoopStore>,
    ) -> anyhow::Result<Self> {
        let mut templates = Handlebars::new();
        templates.set_strict_mode(false);
        templates.register_escape_fn(handlebars::no_escape);
        let template = config
            .continuation_template
            .as_deref()
            .unwrap_or(DEFAULT_CONTINUATION_TEMPLATE);
        templates
            .register_template_string(CONTINUATION_TEMPLATE_NAME, template)
            .context("invalid Ralph continuation template")?;

        let completion_phrase = config.completion_phrase.filter(|p| !p.is_empty());
        let snapshot = LoopSnapshot::new(
            config.session,
            config.prompt,
            config.max_iterations,
            completion_phrase,
        );
        let handle = LoopHandle(Arc::new(Shared {
            snapshot: RwLock::new(snapshot),
            runner: Arc::clone(&runner),
        }));
        Ok(Self {
            runner,
            store,
            templates,
            handle,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Drive the loop to a terminal status.
    pub async fn run(self, sink: &mut impl OutputSink) -> LoopSnapshot {
        let initial = self.handle.snapshot();
        tracing::info!(
            session = %initial.session,
            max_iterations = initial.max_iterations,
            engine = %self.runner.engine(),
            "starting Ralph loop"
        );
        self.save(&initial);

        let mut previous_output = String::new();
        loop {
            let current = self.handle.snapshot();
            if current.status == LoopStatus::Cancelling {
                return self.finish(LoopStatus::Cancelled, StopReason::Cancelled, sink);
            }
            if current.budget_exhausted() {
                return self.finish(LoopStatus::Completed, StopReason::BudgetExhausted, sink);
            }

            let iteration = current.current_iteration + 1;
            let prompt = match self.iteration_prompt(&current, iteration, &previous_output) {
                Ok(prompt) => prompt,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build iteration prompt");
                    self.handle.update(|s| {
                        s.failures += 1;
                        s.last_error = Some(format!("{e:#}"));
                    });
                    return self.finish(LoopStatus::Failed, StopReason::FatalError, sink);
                }
            };
            self.handle.update(|s| s.current_iteration = iteration);
            sink.deliver(LoopOutput::IterationStarted {
                iteration,
                max_iterations: current.max_iterations,
            });

            let outcome = self.run_iteration(&prompt, sink).await;
            sink.deliver(LoopOutput::IterationFinished {
                iteration,
                summary: outcome.summary.clone(),
            });

            let counted_failure = outcome
                .failure
                .as_ref()
                .filter(|f| f.kind != FailureKind::Cancelled);
            let after = self.handle.update(|s| {
                s.total_cost += outcome.summary.cost;
                if let Some(failure) = counted_failure {
                    s.failures += 1;
                    s.last_error = Some(failure.message.clone());
                }
            });
            self.save(&after);
            tracing::info!(
                iteration,
                cost = outcome.summary.cost,
                total_cost = after.total_cost,
                "Ralph iteration finished"
            );

            if after.status == LoopStatus::Cancelling {
                return self.finish(LoopStatus::Cancelled, StopReason::Cancelled, sink);
            }
            if let Some(failure) = &outcome.failure
                && failure.kind.is_fatal()
            {
                tracing::error!(error = %failure, "fatal error, stopping Ralph loop");
                return self.finish(LoopStatus::Failed, StopReason::FatalError, sink);
            }
            if let (Some(phrase), Some(text)) = (&after.completion_phrase, &outcome.result_text)
                && text.contains(phrase.as_str())
            {
                return self.finish(LoopStatus::Completed, StopReason::CompletionPhrase, sink);
            }

            previous_output = outcome.result_text.unwrap_or(outcome.summary.text);
        }
    }

    async fn run_iteration(&self, prompt: &str, sink: &mut impl OutputSink) -> IterationOutcome {
        let mut stream = self.runner.run(prompt, None);
        // A cancel that landed before the run registered would have missed it.
        if self.handle.status() == LoopStatus::Cancelling {
            self.runner.cancel();
        }

        let mut outcome = IterationOutcome::default();
        while let Some(event) = stream.next().await {
            match &event {
                Event::SessionId(_) => continue,
                Event::Result(summary) => {
                    outcome.result_text = Some(summary.text.clone());
                    continue;
                }
                Event::Error(failure) => outcome.failure = Some(failure.clone()),
                Event::Text(_) | Event::Tool(_) | Event::Question(_) => {}
            }
            sink.deliver(LoopOutput::Event(event));
        }
        outcome.summary = stream.finish().await.unwrap_or_default();
        outcome
    }

    fn iteration_prompt(
        &self,
        snapshot: &LoopSnapshot,
        iteration: u32,
        previous_output: &str,
    ) -> anyhow::Result<String> {
        if iteration == 1 {
            return Ok(match &snapshot.completion_phrase {
                Some(phrase) => format!(
                    "{}\n\nWhen the task is fully done, include the exact phrase \"{phrase}\" in your reply.",
                    snapshot.prompt
                ),
                None => snapshot.prompt.clone(),
            });
        }
        self.templates
            .render(
                CONTINUATION_TEMPLATE_NAME,
                &json!({
                    "prompt": snapshot.prompt,
                    "iteration": iteration,
                    "previous_output": tail_chars(previous_output, PREVIOUS_OUTPUT_CHARS),
                    "completion_phrase": snapshot.completion_phrase,
                }),
            )
            .context("failed to render Ralph continuation prompt")
    }

    fn finish(
        &self,
        status: LoopStatus,
        reason: StopReason,
        sink: &mut impl OutputSink,
    ) -> LoopSnapshot {
        // A cancel that landed after the last status check still wins.
        let snapshot = self.handle.update(|s| {
            if s.status == LoopStatus::Cancelling {
                s.status = LoopStatus::Cancelled;
                s.stop_reason = Some(StopReason::Cancelled);
            } else {
                s.status = status;
                s.stop_reason = Some(reason);
            }
        });
        let status = snapshot.status;
        self.save(&snapshot);
        tracing::info!(
            session = %snapshot.session,
            %status,
            iterations = snapshot.current_iteration,
            total_cost = snapshot.total_cost,
            "Ralph loop finished"
        );
        sink.deliver(LoopOutput::Finished(snapshot.clone()));
        snapshot
    }

    fn save(&self, snapshot: &LoopSnapshot) {
        if let Err(e) = self.store.save(snapshot) {
            tracing::warn!(error = %e, session = %snapshot.session, "failed to save loop status");
        }
    }
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::runner::{Engine, RunStream};

    struct IdleRunner;

    impl Runner for IdleRunner {
        fn engine(&self) -> Engine {
            Engine::Claude
        }

        fn run(&self, _prompt: &str, _continuation_id: Option<&str>) -> RunStream {
            RunStream::immediate(
                Event::Result(Box::default()),
                RunSummary::default(),
            )
        }

        fn cancel(&self) {}
    }

    fn ralph(config: RalphConfig) -> RalphLoop {
        RalphLoop::new(config, Arc::new(IdleRunner), Arc::new(MemoryLoopStore::new())).unwrap()
    }

    #[test]
    fn running_status_line() {
        let mut snapshot = LoopSnapshot::new("s", "p", 10, None);
        snapshot.current_iteration = 3;
        snapshot.total_cost = 0.1234;
        insta::assert_snapshot!(snapshot.status_line(), @r"
        Ralph RUNNING
        Iteration: 3/10
        Cost so far: $0.123
        Promise: none
        ");
    }

    #[test]
    fn terminal_status_line() {
        let mut snapshot = LoopSnapshot::new("s", "p", 0, Some("DONE".into()));
        snapshot.current_iteration = 3;
        snapshot.total_cost = 0.1234;
        snapshot.status = LoopStatus::Completed;
        insta::assert_snapshot!(snapshot.status_line(), @r"
        Last Ralph: completed
        Iterations: 3/unlimited
        Cost: $0.123
        ");
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(LoopStatus::Cancelling).unwrap(),
            json!("cancelling")
        );
        assert_eq!(
            serde_json::to_value(StopReason::BudgetExhausted).unwrap(),
            json!("budget_exhausted")
        );
    }

    #[test]
    fn invalid_template_is_rejected() {
        let result = RalphLoop::new(
            RalphConfig {
                continuation_template: Some("{{#if}}".into()),
                ..Default::default()
            },
            Arc::new(IdleRunner),
            Arc::new(MemoryLoopStore::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn first_prompt_carries_completion_instruction() {
        let ralph = ralph(RalphConfig {
            prompt: "Fix the tests".into(),
            completion_phrase: Some("ALL GREEN".into()),
            ..Default::default()
        });
        let snapshot = ralph.handle().snapshot();
        let prompt = ralph.iteration_prompt(&snapshot, 1, "").unwrap();
        assert!(prompt.starts_with("Fix the tests\n\n"));
        assert!(prompt.contains("\"ALL GREEN\""));
    }

    #[test]
    fn first_prompt_is_verbatim_without_phrase() {
        let ralph = ralph(RalphConfig {
            prompt: "Fix <the> tests".into(),
            completion_phrase: Some(String::new()),
            ..Default::default()
        });
        let snapshot = ralph.handle().snapshot();
        assert_eq!(snapshot.completion_phrase, None);
        assert_eq!(ralph.iteration_prompt(&snapshot, 1, "").unwrap(), "Fix <the> tests");
    }

    #[test]
    fn continuation_prompt_uses_template() {
        let ralph = ralph(RalphConfig {
            prompt: "Refactor auth".into(),
            continuation_template: Some(
                "#{{iteration}} {{prompt}} after: {{previous_output}} [{{completion_phrase}}]".into(),
            ),
            ..Default::default()
        });
        let snapshot = ralph.handle().snapshot();
        assert_eq!(
            ralph.iteration_prompt(&snapshot, 2, "did a & b").unwrap(),
            "#2 Refactor auth after: did a & b []"
        );
    }

    #[test]
    fn default_continuation_prompt() {
        let ralph = ralph(RalphConfig {
            prompt: "Refactor auth".into(),
            completion_phrase: Some("DONE".into()),
            ..Default::default()
        });
        let snapshot = ralph.handle().snapshot();
        insta::assert_snapshot!(ralph.iteration_prompt(&snapshot, 2, "split the module").unwrap(), @r#"
        Continue working on this task (iteration 2):

        Refactor auth

        Your previous iteration ended with:

        split the module

        When the task is fully done, include the exact phrase "DONE" in your reply.
        "#);
    }

    #[test]
    fn previous_output_is_tail_limited() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
        assert_eq!(tail_chars("ééé", 2), "éé");
    }

    #[test]
    fn late_cancel_is_not_overwritten_by_completion() {
        let ralph = ralph(RalphConfig {
            max_iterations: 1,
            ..Default::default()
        });
        let handle = ralph.handle();
        handle.cancel();
        let mut sink: Vec<LoopOutput> = Vec::new();
        let snapshot = ralph.finish(LoopStatus::Completed, StopReason::BudgetExhausted, &mut sink);
        assert_eq!(snapshot.status, LoopStatus::Cancelled);
        assert_eq!(snapshot.stop_reason, Some(StopReason::Cancelled));
        assert_eq!(handle.status(), LoopStatus::Cancelled);
        assert_eq!(sink, vec![LoopOutput::Finished(snapshot)]);
    }

    #[tokio::test]
    async fn cancel_on_terminal_loop_is_noop() {
        let ralph = ralph(RalphConfig {
            max_iterations: 1,
            ..Default::default()
        });
        let handle = ralph.handle();
        let mut sink: Vec<LoopOutput> = Vec::new();
        let snapshot = ralph.run(&mut sink).await;
        assert_eq!(snapshot.status, LoopStatus::Completed);
        handle.cancel();
        assert_eq!(handle.status(), LoopStatus::Completed);
    }
}
