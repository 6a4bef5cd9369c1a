use serde::Serialize;

use crate::config::Reasoning;
use crate::event::Answers;

/// Body of `POST /session`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub permission: Vec<PermissionRule>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionRule {
    pub permission: String,
    pub action: String,
    pub pattern: String,
}

impl CreateSessionBody {
    /// A session that allows every tool without prompting.
    pub fn allow_all(title: Option<&str>) -> Self {
        Self {
            title: title.map(str::to_string),
            permission: vec![PermissionRule {
                permission: "*".to_string(),
                action: "allow".to_string(),
                pattern: "*".to_string(),
            }],
        }
    }
}

/// Body of `POST /session/{id}/message`.
#[derive(Debug, Clone, Serialize)]
pub struct MessageBody {
    pub parts: Vec<TextPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub r#type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRef {
    #[serde(rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID")]
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl ModelRef {
    /// Parse a `provider/model` id. Ids without a provider keep only the model.
    pub fn parse(model: &str, reasoning: Reasoning) -> Option<Self> {
        let model = model.trim();
        if model.is_empty() {
            return None;
        }
        let (provider_id, model_id) = match model.split_once('/') {
            Some((provider, id)) if !provider.is_empty() && !id.is_empty() => {
                (Some(provider.to_string()), id.to_string())
            }
            _ => (None, model.to_string()),
        };
        Some(Self {
            provider_id,
            model_id,
            variant: (reasoning == Reasoning::High).then(|| "high".to_string()),
        })
    }
}

impl MessageBody {
    pub fn new(prompt: &str, model: Option<ModelRef>, agent: Option<&str>) -> Self {
        Self {
            parts: vec![TextPart {
                r#type: "text".to_string(),
                text: prompt.to_string(),
            }],
            model,
            agent: agent.filter(|a| !a.is_empty()).map(str::to_string),
        }
    }
}

/// Body of `POST /question/{id}/reply`.
#[derive(Debug, Serialize)]
pub struct QuestionReply<'a> {
    pub answers: &'a Answers,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn message_body_shape() {
        let body = MessageBody::new(
            "hello",
            ModelRef::parse("anthropic/claude-sonnet-4", Reasoning::High),
            Some("bridge"),
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "parts": [{"type": "text", "text": "hello"}],
                "model": {"providerID": "anthropic", "modelID": "claude-sonnet-4", "variant": "high"},
                "agent": "bridge"
            })
        );
    }

    #[test]
    fn message_body_omits_missing_fields() {
        let json = serde_json::to_value(MessageBody::new("hi", None, Some(""))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"parts": [{"type": "text", "text": "hi"}]})
        );
    }

    #[test]
    fn model_without_provider() {
        let model = ModelRef::parse("gpt-5", Reasoning::Normal).unwrap();
        assert_eq!(model.provider_id, None);
        assert_eq!(model.model_id, "gpt-5");
        assert!(ModelRef::parse("  ", Reasoning::Normal).is_none());
    }

    #[test]
    fn create_session_allows_everything() {
        let json = serde_json::to_value(CreateSessionBody::allow_all(Some("work"))).unwrap();
        assert_eq!(json["title"], "work");
        assert_eq!(json["permission"][0]["action"], "allow");
    }

    #[test]
    fn question_reply_shape() {
        let answers = vec![vec!["pg".to_string()], vec![]];
        let json = serde_json::to_value(QuestionReply { answers: &answers }).unwrap();
        assert_eq!(json, serde_json::json!({"answers": [["pg"], []]}));
    }
}
