//! Model response parsing
//!
//! The model is asked to answer with a JSON object of the form
//! `{"response": "...", "actions": [...]}`. In practice it sometimes wraps
//! the object in a markdown code fence or answers in plain prose, so
//! [`parse_response`] is total: anything it cannot interpret becomes a
//! text-only reply.
//!
//! Known limitation: the fenced-block capture is non-greedy and stops at the
//! first `}` that is followed by optional whitespace and a closing fence.
//! Objects with nested braces still parse as long as the innermost match is
//! the whole object, which holds for well-formed single blocks.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::action::{Action, ParsedTurn};

fn fenced_json() -> &'static Regex {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    FENCED.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced JSON pattern is valid")
    })
}

/// Interpret raw model output. Never fails.
pub fn parse_response(text: &str) -> ParsedTurn {
    let Some(data) = parse_object(text).or_else(|| parse_fenced_object(text)) else {
        log::debug!("Model response is not JSON, treating it as plain text");
        return ParsedTurn::text_only(text);
    };

    let reply = match (data.get("response"), data.get("content")) {
        (Some(Value::String(response)), _) => response.as_str(),
        (_, Some(Value::String(content))) => content.as_str(),
        _ => "",
    };

    let actions = match data.get("actions") {
        Some(Value::Array(items)) => items.iter().filter_map(decode_action).collect(),
        _ => Vec::new(),
    };

    ParsedTurn {
        reply_text: if reply.is_empty() { text } else { reply }.to_string(),
        actions,
    }
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn parse_fenced_object(text: &str) -> Option<Map<String, Value>> {
    let captures = fenced_json().captures(text)?;
    parse_object(captures.get(1)?.as_str())
}

/// Shape of one element of the `actions` array after type checks
enum ActionEntry<'a> {
    Valid {
        domain: &'a str,
        service: &'a str,
        target: &'a str,
        data: Option<&'a Map<String, Value>>,
        delay: Option<f64>,
    },
    Malformed,
}

impl<'a> From<&'a Value> for ActionEntry<'a> {
    fn from(value: &'a Value) -> Self {
        let Value::Object(entry) = value else {
            return Self::Malformed;
        };
        let field = |name: &str| entry.get(name).and_then(Value::as_str);

        match (field("domain"), field("service"), field("target")) {
            (Some(domain), Some(service), Some(target)) => Self::Valid {
                domain,
                service,
                target,
                data: entry.get("data").and_then(Value::as_object),
                delay: entry
                    .get("delay_seconds")
                    .and_then(Value::as_f64)
                    .filter(|seconds| *seconds > 0.0),
            },
            _ => Self::Malformed,
        }
    }
}

fn decode_action(value: &Value) -> Option<Action> {
    match ActionEntry::from(value) {
        ActionEntry::Valid {
            domain,
            service,
            target,
            data,
            delay,
        } => {
            let mut action = Action::new(domain, service, target)
                .with_parameters(data.cloned().unwrap_or_default());
            if let Some(seconds) = delay {
                action = action.with_delay(seconds);
            }
            Some(action)
        }
        ActionEntry::Malformed => {
            log::debug!("Skipping malformed action entry: {value}");
            None
        }
    }
}
