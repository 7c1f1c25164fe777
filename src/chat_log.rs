//! Conversation history shared between the host and an agent
//!
//! A chat log holds the role-tagged entries of one conversation. The first
//! entry is always the system prompt, which is rebuilt on every turn by
//! [`ChatLog::provide_llm_data`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::ConverseError;

/// Control API ids an agent may be configured with
pub const KNOWN_LLM_APIS: &[&str] = &["assist"];

const DEFAULT_INSTRUCTIONS_PROMPT: &str = "You are a voice assistant for Home Assistant.\n\
Answer questions about the world truthfully.\n\
Answer in plain text. Keep it simple and to the point.";

/// A file attached to a user message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    pub path: PathBuf,
    pub mime_type: Option<String>,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserContent {
    pub content: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantContent {
    pub agent_id: String,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResultContent {
    pub agent_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub tool_result: Value,
}

/// One chat log entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Content {
    System { content: String },
    User(UserContent),
    Assistant(AssistantContent),
    ToolResult(ToolResultContent),
}

impl Content {
    pub fn role(&self) -> &'static str {
        match self {
            Content::System { .. } => "system",
            Content::User(_) => "user",
            Content::Assistant(_) => "assistant",
            Content::ToolResult(_) => "tool_result",
        }
    }
}

/// Host-side resolver for tool calls
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, call: &ToolCall) -> anyhow::Result<Value>;
}

type DeltaListener = Box<dyn Fn(&str) + Send + Sync>;

/// Prompt inputs for one turn
#[derive(Debug, Clone, Copy, Default)]
pub struct LlmData<'a> {
    pub user_prompt: Option<&'a str>,
    pub llm_api_ids: &'a [String],
    pub extra_system_prompt: Option<&'a str>,
}

pub struct ChatLog {
    conversation_id: String,
    content: Vec<Content>,
    extra_system_prompt: Option<String>,
    delta_listener: Option<DeltaListener>,
    tool_handler: Option<Arc<dyn ToolHandler>>,
}

impl ChatLog {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            content: vec![Content::System {
                content: String::new(),
            }],
            extra_system_prompt: None,
            delta_listener: None,
            tool_handler: None,
        }
    }

    /// Receive assistant text as it becomes visible
    pub fn with_delta_listener(mut self, listener: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.delta_listener = Some(Box::new(listener));
        self
    }

    pub fn with_tool_handler(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.tool_handler = Some(handler);
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn content(&self) -> &[Content] {
        &self.content
    }

    pub fn add_user_content(&mut self, content: UserContent) {
        self.content.push(Content::User(content));
    }

    /// Rebuild the system prompt for the coming turn.
    ///
    /// An extra system prompt given on an earlier turn is reused when none is
    /// given now.
    pub fn provide_llm_data(&mut self, data: LlmData<'_>) -> Result<(), ConverseError> {
        if let Some(unknown) = data
            .llm_api_ids
            .iter()
            .find(|id| !KNOWN_LLM_APIS.contains(&id.as_str()))
        {
            return Err(ConverseError::new(format!(
                "Error preparing LLM API: API {unknown} not found"
            )));
        }

        if let Some(extra) = data.extra_system_prompt {
            self.extra_system_prompt = Some(extra.to_string());
        }

        let now = Local::now();
        let mut parts = vec![
            format!(
                "Current time is {}. Today's date is {}.",
                now.format("%H:%M:%S"),
                now.format("%Y-%m-%d")
            ),
            data.user_prompt
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(DEFAULT_INSTRUCTIONS_PROMPT)
                .to_string(),
        ];
        if let Some(extra) = &self.extra_system_prompt {
            parts.push(extra.clone());
        }

        self.content[0] = Content::System {
            content: parts.join("\n"),
        };
        Ok(())
    }

    /// Forward visible assistant text to the listener, if any
    pub fn emit_delta(&self, text: &str) {
        if let Some(listener) = &self.delta_listener {
            listener(text);
        }
    }

    /// Append an assistant message and resolve any tool calls it carries.
    ///
    /// Returns the entries that were added.
    pub async fn add_assistant_content(&mut self, content: AssistantContent) -> Vec<Content> {
        let start = self.content.len();
        let calls = content.tool_calls.clone();
        let agent_id = content.agent_id.clone();
        self.content.push(Content::Assistant(content));

        if !calls.is_empty() {
            match self.tool_handler.clone() {
                Some(handler) => {
                    for call in calls {
                        log::debug!("Calling tool {} with {}", call.name, call.arguments);
                        let tool_result = handler
                            .call(&call)
                            .await
                            .unwrap_or_else(|err| json!({"error": err.to_string()}));
                        self.content.push(Content::ToolResult(ToolResultContent {
                            agent_id: agent_id.clone(),
                            tool_call_id: call.id,
                            tool_name: call.name,
                            tool_result,
                        }));
                    }
                }
                None => log::warn!(
                    "Model requested {} tool call(s) but no tool handler is attached",
                    calls.len()
                ),
            }
        }

        self.content[start..].to_vec()
    }

    /// True when tool results were added that the model has not seen yet
    pub fn unresponded_tool_results(&self) -> bool {
        matches!(self.content.last(), Some(Content::ToolResult(_)))
    }

    /// Text of the final assistant message, if the log ends with one
    pub fn last_assistant_text(&self) -> Option<&str> {
        match self.content.last() {
            Some(Content::Assistant(assistant)) => assistant.content.as_deref(),
            _ => None,
        }
    }
}
