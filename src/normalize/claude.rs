use serde_json::Value;

use super::Normalize;
use crate::display::tool_format::{ToolFormat, claude_tool_description};
use crate::event::{Event, Failure};
use crate::protocol::types::{
    AssistantContentBlock, InboundEvent, SessionResult, SystemEvent,
};
use crate::session::state::RunState;

/// Normalizer for claude's `stream-json` output.
#[derive(Debug, Clone, Default)]
pub struct ClaudeNormalizer {
    pub tool_format: ToolFormat,
}

impl ClaudeNormalizer {
    pub fn new(tool_format: ToolFormat) -> Self {
        Self { tool_format }
    }

    fn assistant(&self, blocks: &[AssistantContentBlock], state: &mut RunState) -> Vec<Event> {
        let mut events = Vec::new();
        for block in blocks {
            match block {
                AssistantContentBlock::Text { text } => {
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if !state.text.is_empty() {
                        state.text.push_str("\n\n");
                    }
                    state.text.push_str(text);
                    events.push(Event::Text(text.to_string()));
                }
                AssistantContentBlock::ToolUse { name, input, .. } => {
                    state.tool_count += 1;
                    events.push(Event::Tool(claude_tool_description(
                        name,
                        input,
                        self.tool_format,
                    )));
                }
                AssistantContentBlock::Other => {}
            }
        }
        events
    }

    fn result(result: &SessionResult, state: &mut RunState) -> Vec<Event> {
        let mut events = Vec::new();
        if state.observe_session_id(&result.session_id) {
            events.push(Event::SessionId(result.session_id.clone()));
        }
        if result.is_error {
            let message = if result.result.is_empty() {
                "Unknown error"
            } else {
                &result.result
            };
            events.extend(state.finish_with_error(Failure::remote(message)));
            return events;
        }
        if let Some(usage) = &result.usage {
            state.tokens.input = state.tokens.input.max(usage.input_tokens);
            state.tokens.output = state.tokens.output.max(usage.output_tokens);
            state.tokens.cache_read = state.tokens.cache_read.max(usage.cache_read_input_tokens);
            state.tokens.cache_write = state
                .tokens
                .cache_write
                .max(usage.cache_creation_input_tokens);
        }
        state.add_cost(result.total_cost_usd);
        state.turns = Some(result.num_turns);
        state.context_window = Some(result.context_window());
        if state.text.is_empty() {
            state.text.clone_from(&result.result);
        }
        events.extend(state.finish_with_result());
        events
    }
}

impl Normalize for ClaudeNormalizer {
    fn normalize(&self, raw: &Value, state: &mut RunState) -> Vec<Event> {
        let event = match serde_json::from_value::<InboundEvent>(raw.clone()) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable claude message");
                return Vec::new();
            }
        };
        match event {
            InboundEvent::System(SystemEvent::Init(init)) => {
                if state.observe_session_id(&init.session_id) {
                    vec![Event::SessionId(init.session_id)]
                } else {
                    Vec::new()
                }
            }
            InboundEvent::Assistant(msg) => self.assistant(&msg.message.content, state),
            InboundEvent::Result(result) => Self::result(&result, state),
            InboundEvent::System(SystemEvent::Other) | InboundEvent::Other => Vec::new(),
        }
    }
}
