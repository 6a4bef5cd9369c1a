use serde_json::Value;

use super::{Normalize, counter, first_str};
use crate::display::tool_format::{ToolFormat, opencode_tool_description};
use crate::event::{Event, Failure, Question, TokenUsage};
use crate::session::state::RunState;

type Handler = fn(&OpenCodeNormalizer, &Value, &mut RunState) -> Option<Event>;

/// Dispatch table keyed by the message `type`. Unknown types are ignored.
const HANDLERS: &[(&str, Handler)] = &[
    ("step_start", OpenCodeNormalizer::step_start),
    ("text", OpenCodeNormalizer::text),
    ("tool_use", OpenCodeNormalizer::tool_use),
    ("step_finish", OpenCodeNormalizer::step_finish),
    ("error", OpenCodeNormalizer::error),
    ("question.asked", OpenCodeNormalizer::question),
    ("question", OpenCodeNormalizer::question),
];

const REQUEST_ID_KEYS: [&str; 4] = ["requestID", "requestId", "request_id", "id"];

/// Normalizer for OpenCode's JSON events, shared by the CLI line stream and
/// the HTTP service stream (after [`coerce_event`](super::envelope::coerce_event)).
#[derive(Debug, Clone, Default)]
pub struct OpenCodeNormalizer {
    pub tool_format: ToolFormat,
}

#[allow(clippy::unused_self)]
impl OpenCodeNormalizer {
    pub fn new(tool_format: ToolFormat) -> Self {
        Self { tool_format }
    }

    fn step_start(&self, event: &Value, state: &mut RunState) -> Option<Event> {
        let id = first_str(event, &["sessionID"])?;
        state
            .observe_session_id(id)
            .then(|| Event::SessionId(id.to_string()))
    }

    fn text(&self, event: &Value, state: &mut RunState) -> Option<Event> {
        let text = event.get("part")?.get("text")?.as_str()?;
        if text.is_empty() {
            return None;
        }
        state.text.push_str(text);
        Some(Event::Text(text.to_string()))
    }

    fn tool_use(&self, event: &Value, state: &mut RunState) -> Option<Event> {
        let part = event.get("part")?;
        let tool = first_str(part, &["tool"])?;
        state.tool_count += 1;
        Some(Event::Tool(opencode_tool_description(
            tool,
            part,
            self.tool_format,
        )))
    }

    fn step_finish(&self, event: &Value, state: &mut RunState) -> Option<Event> {
        let part = event.get("part")?;
        if let Some(tokens) = part.get("tokens") {
            let cache = tokens.get("cache");
            state.tokens.add(&TokenUsage {
                input: counter(tokens.get("input")),
                output: counter(tokens.get("output")),
                reasoning: counter(tokens.get("reasoning")),
                cache_read: counter(cache.and_then(|c| c.get("read"))),
                cache_write: counter(cache.and_then(|c| c.get("write"))),
            });
        }
        state.add_cost(part.get("cost").and_then(Value::as_f64).unwrap_or(0.0));
        if part.get("reason").and_then(Value::as_str) == Some("stop") {
            return state.finish_with_result();
        }
        None
    }

    fn error(&self, event: &Value, state: &mut RunState) -> Option<Event> {
        let message = error_message(event.get("message"))
            .or_else(|| error_message(event.get("error")))
            .unwrap_or_else(|| "OpenCode error".to_string());
        state.finish_with_error(Failure::remote(message))
    }

    fn question(&self, event: &Value, state: &mut RunState) -> Option<Event> {
        let props = event.get("properties");
        let request_id = first_str(event, &REQUEST_ID_KEYS)
            .or_else(|| props.and_then(|p| first_str(p, &REQUEST_ID_KEYS)));
        let Some(request_id) = request_id else {
            tracing::warn!(%event, "question event missing request id");
            return None;
        };
        if !state.observe_question(request_id) {
            tracing::debug!(request_id, "duplicate question ignored");
            return None;
        }
        let items = event
            .get("questions")
            .or_else(|| props.and_then(|p| p.get("questions")))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Some(Event::Question(Question::from_raw(request_id, items)))
    }
}

/// Human message from an error field: nested `data.message`, then `message`,
/// then the value itself when it is a string.
fn error_message(value: Option<&Value>) -> Option<String> {
    let value = value?;
    if let Some(s) = value.as_str() {
        return (!s.is_empty()).then(|| s.to_string());
    }
    value
        .get("data")
        .and_then(|d| first_str(d, &["message"]))
        .or_else(|| first_str(value, &["message"]))
        .map(str::to_string)
}

impl Normalize for OpenCodeNormalizer {
    fn normalize(&self, raw: &Value, state: &mut RunState) -> Vec<Event> {
        let Some(event_type) = raw.get("type").and_then(Value::as_str) else {
            return Vec::new();
        };
        HANDLERS
            .iter()
            .find(|(name, _)| *name == event_type)
            .and_then(|(_, handler)| handler(self, raw, state))
            .into_iter()
            .collect()
    }
}
