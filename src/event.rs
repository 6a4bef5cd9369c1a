use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical, engine-agnostic event emitted by a [`Runner`](crate::runner::Runner).
///
/// A well-formed run emits any number of `SessionId`, `Text`, `Tool` and
/// `Question` events followed by exactly one `Result` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// Continuation id for resuming the remote conversation.
    SessionId(String),
    /// Incremental output fragment (never the cumulative text).
    Text(String),
    /// Short human-readable description of a tool invocation.
    Tool(String),
    /// The agent is blocked on externally supplied input.
    Question(Question),
    Result(Box<RunSummary>),
    Error(Failure),
}

impl Event {
    /// Whether this event terminates a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Result(_) | Event::Error(_))
    }
}

/// Per-category token counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl TokenUsage {
    /// Add another set of deltas into these counters.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.reasoning = self.reasoning.saturating_add(other.reasoning);
        self.cache_read = self.cache_read.saturating_add(other.cache_read);
        self.cache_write = self.cache_write.saturating_add(other.cache_write);
    }

    pub fn total(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.reasoning)
            .saturating_add(self.cache_read)
            .saturating_add(self.cache_write)
    }
}

/// Immutable snapshot of a run's statistics, taken when the run completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub text: String,
    pub session_id: Option<String>,
    pub cost: f64,
    pub tokens: TokenUsage,
    pub duration_ms: u64,
    pub tool_count: u32,
    /// Number of agent turns, when the engine reports it.
    #[serde(default)]
    pub turns: Option<u32>,
    /// Context window of the model, when the engine reports it.
    #[serde(default)]
    pub context_window: Option<u64>,
}

impl RunSummary {
    /// Compact one-line summary, e.g. `[3t 2tools $0.012 4.2s | 12.3k/200k]`.
    pub fn summary_line(&self) -> String {
        #[allow(clippy::cast_precision_loss)]
        let secs = self.duration_ms as f64 / 1000.0;
        #[allow(clippy::cast_precision_loss)]
        let tokens_k = self.tokens.total() as f64 / 1000.0;
        let turns = self.turns.map(|t| format!("{t}t ")).unwrap_or_default();
        let mut line = format!(
            "[{turns}{} tools ${:.3} {secs:.1}s | {tokens_k:.1}k",
            self.tool_count, self.cost
        );
        if let Some(window) = self.context_window {
            line.push_str(&format!("/{}k", window / 1000));
        }
        line.push(']');
        line
    }
}

/// Classification of a run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The agent process could not be started.
    Spawn,
    /// Connection, HTTP or event-feed failure.
    Transport,
    /// Output could not be interpreted at all.
    Protocol,
    /// The engine reported an explicit failure.
    Remote,
    Cancelled,
    Timeout,
    /// Malformed configuration.
    Config,
}

impl FailureKind {
    /// Fatal failures stop a loop instead of being retried as the next iteration.
    pub fn is_fatal(self) -> bool {
        matches!(self, FailureKind::Spawn | FailureKind::Config)
    }
}

/// Payload of [`Event::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Remote, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "run cancelled")
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One selectable option of a question item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
}

/// One sub-question of a [`Question`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionItem {
    #[serde(default)]
    pub header: String,
    #[serde(default, alias = "question")]
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
}

/// An outstanding request for external input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Engine-assigned id, unique per pending question.
    pub request_id: String,
    pub items: Vec<QuestionItem>,
}

impl Question {
    /// Build a question from a raw item list, skipping items that don't decode.
    pub fn from_raw(request_id: impl Into<String>, raw_items: &[Value]) -> Self {
        let items = raw_items
            .iter()
            .filter_map(|item| serde_json::from_value::<QuestionItem>(item.clone()).ok())
            .collect();
        Self {
            request_id: request_id.into(),
            items,
        }
    }
}

/// Answers to a question: one list of selected labels per item, in order.
pub type Answers = Vec<Vec<String>>;
