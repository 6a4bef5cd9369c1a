use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level inbound message from claude's stream-json output.
///
/// Only the message types that carry run-relevant data are modeled; every
/// other `type` decodes to [`InboundEvent::Other`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "system")]
    System(SystemEvent),
    #[serde(rename = "assistant")]
    Assistant(AssistantMessage),
    #[serde(rename = "result")]
    Result(SessionResult),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype")]
pub enum SystemEvent {
    #[serde(rename = "init")]
    Init(InitEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitEvent {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub message: AssistantMessageBody,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessageBody {
    #[serde(default)]
    pub content: Vec<AssistantContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AssistantContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default, rename = "modelUsage")]
    pub model_usage: BTreeMap<String, ModelUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    #[serde(default, rename = "contextWindow")]
    pub context_window: Option<u64>,
}

/// Context window assumed when the result carries no model usage.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

impl SessionResult {
    /// Context window of the model that ran: an opus model wins, otherwise the
    /// largest window reported.
    pub fn context_window(&self) -> u64 {
        if let Some(window) = self
            .model_usage
            .iter()
            .find(|(name, _)| name.contains("opus"))
            .and_then(|(_, usage)| usage.context_window)
        {
            return window;
        }
        self.model_usage
            .values()
            .filter_map(|usage| usage.context_window)
            .max()
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn parse(line: &str) -> InboundEvent {
        serde_json::from_str(line).unwrap()
    }

    #[test]
    fn unknown_type_is_other() {
        assert!(matches!(
            parse(r#"{"type":"rate_limit_event","rate_limit_info":{}}"#),
            InboundEvent::Other
        ));
    }

    #[test]
    fn unknown_fields_dont_crash() {
        let line = r#"{"type":"result","subtype":"success","total_cost_usd":0.01,"num_turns":1,"duration_ms":100,"result":"ok","session_id":"x","unknown_field":"value","another":123}"#;
        let InboundEvent::Result(result) = parse(line) else {
            panic!("expected result");
        };
        assert_eq!(result.result, "ok");
        assert!(!result.is_error);
    }

    #[test]
    fn unknown_content_block_is_other() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hm"},{"type":"text","text":"hi"}]}}"#;
        let InboundEvent::Assistant(msg) = parse(line) else {
            panic!("expected assistant");
        };
        assert!(matches!(msg.message.content[0], AssistantContentBlock::Other));
        assert!(matches!(msg.message.content[1], AssistantContentBlock::Text { .. }));
    }

    #[test]
    fn context_window_prefers_opus() {
        let line = r#"{"type":"result","modelUsage":{"claude-haiku":{"contextWindow":100000},"claude-opus-4":{"contextWindow":1000000}}}"#;
        let InboundEvent::Result(result) = parse(line) else {
            panic!("expected result");
        };
        assert_eq!(result.context_window(), 1_000_000);
    }

    #[test]
    fn context_window_defaults() {
        let InboundEvent::Result(result) = parse(r#"{"type":"result"}"#) else {
            panic!("expected result");
        };
        assert_eq!(result.context_window(), DEFAULT_CONTEXT_WINDOW);
    }
}
