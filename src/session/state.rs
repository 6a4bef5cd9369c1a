use std::collections::HashSet;
use std::time::Instant;

use crate::event::{Event, Failure, RunSummary, TokenUsage};

/// Default number of unparseable lines kept for the fallback diagnostic.
pub const DEFAULT_RAW_LINE_CAP: usize = 5;
/// Upper bound for the configurable raw-line cap.
pub const MAX_RAW_LINE_CAP: usize = 50;

/// Accumulates in-flight statistics for a single run.
///
/// Created when a run starts and dropped when it ends; never shared between runs.
#[derive(Debug)]
pub struct RunState {
    started: Instant,
    pub session_id: Option<String>,
    pub text: String,
    pub tool_count: u32,
    pub tokens: TokenUsage,
    pub cost: f64,
    pub turns: Option<u32>,
    pub context_window: Option<u64>,
    pub saw_result: bool,
    pub saw_error: bool,
    raw_lines: Vec<String>,
    raw_line_cap: usize,
    questions_seen: HashSet<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new(DEFAULT_RAW_LINE_CAP)
    }
}

impl RunState {
    pub fn new(raw_line_cap: usize) -> Self {
        Self {
            started: Instant::now(),
            session_id: None,
            text: String::new(),
            tool_count: 0,
            tokens: TokenUsage::default(),
            cost: 0.0,
            turns: None,
            context_window: None,
            saw_result: false,
            saw_error: false,
            raw_lines: Vec::new(),
            raw_line_cap: raw_line_cap.clamp(1, MAX_RAW_LINE_CAP),
            questions_seen: HashSet::new(),
        }
    }

    /// Whether a terminal event has already been produced.
    pub fn is_terminal(&self) -> bool {
        self.saw_result || self.saw_error
    }

    /// Whether the run produced anything beyond a session id.
    pub fn has_output(&self) -> bool {
        !self.text.is_empty() || self.tool_count > 0 || self.tokens.total() > 0 || self.cost > 0.0
    }

    /// Record a session id. Returns `true` if it differs from the current one.
    pub fn observe_session_id(&mut self, id: &str) -> bool {
        if id.is_empty() || self.session_id.as_deref() == Some(id) {
            return false;
        }
        self.session_id = Some(id.to_string());
        true
    }

    /// Record a question request id. Returns `true` the first time an id is seen.
    pub fn observe_question(&mut self, request_id: &str) -> bool {
        self.questions_seen.insert(request_id.to_string())
    }

    /// Add a cost delta. Negative and non-finite deltas are ignored so the
    /// counter never decreases.
    pub fn add_cost(&mut self, delta: f64) {
        if delta.is_finite() && delta > 0.0 {
            self.cost += delta;
        }
    }

    /// Keep an unparseable line for diagnostics. Returns `false` once the cap is hit.
    pub fn record_raw_line(&mut self, line: &str) -> bool {
        if self.raw_lines.len() >= self.raw_line_cap {
            return false;
        }
        self.raw_lines.push(line.to_string());
        true
    }

    pub fn raw_lines(&self) -> &[String] {
        &self.raw_lines
    }

    /// Produce the terminal `Result` event, unless the run already terminated.
    pub fn finish_with_result(&mut self) -> Option<Event> {
        if self.is_terminal() {
            return None;
        }
        self.saw_result = true;
        Some(Event::Result(Box::new(self.summary())))
    }

    /// Produce the terminal `Error` event, unless the run already terminated.
    pub fn finish_with_error(&mut self, failure: Failure) -> Option<Event> {
        if self.is_terminal() {
            return None;
        }
        self.saw_error = true;
        Some(Event::Error(failure))
    }

    /// Snapshot of the current statistics.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            text: self.text.clone(),
            session_id: self.session_id.clone(),
            cost: self.cost,
            tokens: self.tokens,
            duration_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            tool_count: self.tool_count,
            turns: self.turns,
            context_window: self.context_window,
        }
    }
}
