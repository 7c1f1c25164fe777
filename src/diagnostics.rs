//! Config entry diagnostics with secrets redacted

use anyhow::Result;
use serde_json::{json, Value};

use crate::config::AppConfig;

pub const REDACTED: &str = "**REDACTED**";

const TO_REDACT: &[&str] = &["api_key", "token"];

/// Replace the value of every key in `keys`, at any depth
pub fn redact(value: &mut Value, keys: &[&str]) {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if keys.contains(&key.as_str()) && !item.is_null() {
                    *item = Value::String(REDACTED.to_string());
                } else {
                    redact(item, keys);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact(item, keys);
            }
        }
        _ => {}
    }
}

pub fn config_entry_diagnostics(title: &str, config: &AppConfig) -> Result<Value> {
    let mut diagnostics = json!({
        "title": title,
        "data": {
            "perplexity": serde_json::to_value(&config.perplexity)?,
            "homeassistant": serde_json::to_value(&config.homeassistant)?,
        },
        "subentries": serde_json::to_value(&config.agents)?,
    });
    redact(&mut diagnostics, TO_REDACT);
    Ok(diagnostics)
}
