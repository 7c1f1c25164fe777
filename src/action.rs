//! Device actions recovered from model output
//!
//! An [`Action`] is one intended service call against a Home Assistant
//! entity. A [`ParsedTurn`] is the outcome of interpreting one model
//! response: the text shown to the user plus the actions to run, in order.

use std::fmt;
use std::time::{Duration, TryFromFloatSecsError};

use serde::Serialize;
use serde_json::{Map, Value};

/// A single device-control instruction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    /// Device category namespace (e.g. `light`)
    pub domain: String,
    /// Operation within the domain (e.g. `turn_on`)
    pub service: String,
    /// Entity to act on (e.g. `light.kitchen`)
    pub target: String,
    /// Extra service arguments, empty if none were given
    pub parameters: Map<String, Value>,
    /// Deferral in seconds; always positive when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<f64>,
}

impl Action {
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            target: target.into(),
            parameters: Map::new(),
            delay_seconds: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the deferral. Non-positive or non-finite values mean "run now".
    pub fn with_delay(mut self, seconds: f64) -> Self {
        self.delay_seconds = (seconds.is_finite() && seconds > 0.0).then_some(seconds);
        self
    }

    /// The deferral as a duration, `None` for immediate actions.
    /// Fails when the delay does not fit in a [`Duration`].
    pub fn delay(&self) -> Result<Option<Duration>, TryFromFloatSecsError> {
        self.delay_seconds
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::try_from_secs_f64)
            .transpose()
    }

    /// Service payload: `{"entity_id": target, ...parameters}`
    pub fn service_data(&self) -> Value {
        let mut data = Map::with_capacity(self.parameters.len() + 1);
        data.insert("entity_id".to_string(), Value::String(self.target.clone()));
        for (key, value) in &self.parameters {
            data.insert(key.clone(), value.clone());
        }
        Value::Object(data)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {} ({})",
            self.domain,
            self.service,
            self.target,
            Value::Object(self.parameters.clone())
        )?;
        if let Some(delay) = self.delay_seconds {
            write!(f, " [delay={delay}s]")?;
        }
        Ok(())
    }
}

/// The interpretation of one model response
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedTurn {
    pub reply_text: String,
    pub actions: Vec<Action>,
}

impl ParsedTurn {
    /// Plain reply without any actions
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            reply_text: text.into(),
            actions: Vec::new(),
        }
    }
}
