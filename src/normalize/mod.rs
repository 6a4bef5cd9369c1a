//! Translation of engine-native messages into canonical [`Event`]s.
//!
//! A normalizer is pure apart from the [`RunState`] it is handed: the same
//! message sequence against a fresh state always yields the same events.

pub mod claude;
pub mod envelope;
pub mod opencode;

use serde_json::Value;

use crate::event::Event;
use crate::session::state::RunState;

pub use claude::ClaudeNormalizer;
pub use opencode::OpenCodeNormalizer;

/// Converts one decoded JSON object into zero or more canonical events.
pub trait Normalize: Send + Sync {
    fn normalize(&self, raw: &Value, state: &mut RunState) -> Vec<Event>;
}

/// Read a non-negative integer counter that may be encoded as a float.
pub(crate) fn counter(value: Option<&Value>) -> u64 {
    match value {
        Some(v) => v
            .as_u64()
            .or_else(|| {
                v.as_f64()
                    .filter(|f| f.is_finite() && *f > 0.0)
                    .map(|f| {
                        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                        let n = f as u64;
                        n
                    })
            })
            .unwrap_or(0),
        None => 0,
    }
}

/// First non-empty string found under any of `keys`.
pub(crate) fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counter_accepts_ints_and_floats() {
        assert_eq!(counter(Some(&json!(12))), 12);
        assert_eq!(counter(Some(&json!(3.9))), 3);
        assert_eq!(counter(Some(&json!(-4))), 0);
        assert_eq!(counter(Some(&json!("7"))), 0);
        assert_eq!(counter(None), 0);
    }

    #[test]
    fn first_str_skips_empty_values() {
        let value = json!({"id": "", "requestID": "r1"});
        assert_eq!(first_str(&value, &["id", "requestID"]), Some("r1"));
        assert_eq!(first_str(&value, &["missing"]), None);
    }
}
