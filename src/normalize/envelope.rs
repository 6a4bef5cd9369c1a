use serde_json::{Map, Value, json};

const SESSION_KEYS: [&str; 3] = ["sessionID", "sessionId", "session_id"];

/// Types the OpenCode handler table understands without unwrapping.
const CANONICAL_TYPES: [&str; 5] = ["step_start", "step_finish", "text", "tool_use", "error"];

/// Rewrite a service-stream payload into the canonical shape the OpenCode
/// handler table expects. Returns `None` for payloads that carry nothing a
/// run cares about.
pub fn coerce_event(payload: &Value) -> Option<Value> {
    let obj = payload.as_object()?;
    if obj.contains_key("type") && obj.contains_key("part") {
        return Some(payload.clone());
    }
    let event_type = obj.get("type")?.as_str()?;
    let props = obj
        .get("properties")
        .and_then(Value::as_object)
        .filter(|p| !p.is_empty());

    if let Some(props) = props {
        match event_type {
            "question.asked" | "question" => return Some(merged("question.asked", props)),
            "permission.requested" | "session.permission.requested" => {
                return Some(merged("permission.requested", props));
            }
            "session.idle" => return Some(json!({"type": "session.idle"})),
            _ => {}
        }
        if let Some(part) = props.get("part").and_then(Value::as_object) {
            let part_value = Value::Object(part.clone());
            match part.get("type").and_then(Value::as_str) {
                Some("text") => {
                    let text = part.get("text").and_then(Value::as_str).unwrap_or_default();
                    return Some(json!({"type": "text", "part": {"text": text}}));
                }
                Some("tool" | "tool_use") => {
                    return Some(json!({"type": "tool_use", "part": part_value}));
                }
                Some("question" | "question.asked") => {
                    return Some(merged("question.asked", part));
                }
                Some("step-start" | "step_start") => {
                    let mut out = json!({"type": "step_start", "part": part_value});
                    if let Some(id) = extract_session_id(payload) {
                        out["sessionID"] = Value::String(id.to_string());
                    }
                    return Some(out);
                }
                Some("step-finish" | "step_finish") => {
                    return Some(json!({"type": "step_finish", "part": part_value}));
                }
                _ => {}
            }
        }
        if matches!(event_type, "error" | "session.error") {
            return Some(merged("error", props));
        }
    }

    CANONICAL_TYPES
        .contains(&event_type)
        .then(|| payload.clone())
}

fn merged(event_type: &str, props: &Map<String, Value>) -> Value {
    let mut out = props.clone();
    out.insert("type".to_string(), Value::String(event_type.to_string()));
    Value::Object(out)
}

/// Session id a payload belongs to, if it names one.
pub fn extract_session_id(payload: &Value) -> Option<&str> {
    let props = payload.get("properties");
    let nested = props
        .into_iter()
        .flat_map(|p| [p.get("part"), p.get("info")])
        .flatten();
    std::iter::once(payload)
        .chain(props)
        .chain(nested)
        .find_map(|scope| {
            SESSION_KEYS
                .iter()
                .filter_map(|k| scope.get(*k).and_then(Value::as_str))
                .find(|s| !s.is_empty())
        })
}
