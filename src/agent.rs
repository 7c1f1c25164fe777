//! Backend adapter shared by the conversation and AI task agents
//!
//! Converts chat-log entries into Perplexity messages, attaches images to
//! the last user turn, picks model parameters, and drives the request loop
//! until the chat log has no unanswered tool results.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backend::{
    is_reasoning_model, ChatBackend, ChatMessage, ChatRequest, Completion, ContentPart, ImageUrl,
    MessageContent, DEFAULT_REASONING_EFFORT, REASONING_EFFORT_OPTIONS,
};
use crate::chat_log::{AssistantContent, Attachment, ChatLog, Content};
use crate::config::AgentConfig;
use crate::error::{AgentError, BackendError};
use crate::setup::EntryRuntime;

/// Max number of back and forth with the model for one turn
pub const MAX_TOOL_ITERATIONS: usize = 10;

/// What to do when the tool-result loop runs out of iterations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationLimitPolicy {
    /// Keep whatever the last round trip produced
    #[default]
    Stop,
    /// Fail the turn
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPolicy {
    pub max_iterations: usize,
    pub on_exhausted: IterationLimitPolicy,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            max_iterations: MAX_TOOL_ITERATIONS,
            on_exhausted: IterationLimitPolicy::Stop,
        }
    }
}

/// Rewrites the raw model text before it enters the chat log
pub trait ResponseTransform: Send {
    fn transform(&mut self, raw: &str) -> String;
}

/// How one [`AgentCore::handle_chat_log`] call talks to the backend
#[derive(Default)]
pub struct ChatOptions<'a> {
    pub response_format: Option<Value>,
    pub stream: bool,
    pub transform: Option<&'a mut dyn ResponseTransform>,
}

/// State and behavior common to every agent of a config entry
pub struct AgentCore {
    entry: Arc<EntryRuntime>,
    settings: AgentConfig,
    entity_id: String,
    policy: LoopPolicy,
}

impl AgentCore {
    pub fn new(
        entry: Arc<EntryRuntime>,
        settings: AgentConfig,
        entity_id: String,
        policy: LoopPolicy,
    ) -> Self {
        Self {
            entry,
            settings,
            entity_id,
            policy,
        }
    }

    pub fn entry(&self) -> &EntryRuntime {
        &self.entry
    }

    pub fn settings(&self) -> &AgentConfig {
        &self.settings
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn reasoning_effort(&self) -> String {
        match self.settings.reasoning_effort.as_deref() {
            Some(effort) if REASONING_EFFORT_OPTIONS.contains(&effort) => effort.to_string(),
            Some(effort) => {
                log::warn!(
                    "{}: unknown reasoning effort '{effort}', using {DEFAULT_REASONING_EFFORT}",
                    self.entity_id
                );
                DEFAULT_REASONING_EFFORT.to_string()
            }
            None => DEFAULT_REASONING_EFFORT.to_string(),
        }
    }

    fn base_request(&self) -> ChatRequest {
        let model = self.settings.model.clone();
        let reasoning_effort = is_reasoning_model(&model).then(|| self.reasoning_effort());

        ChatRequest {
            model,
            messages: Vec::new(),
            disable_search: Some(!self.settings.web_search),
            reasoning_effort,
            ..Default::default()
        }
    }

    fn map_backend_error(&self, err: BackendError) -> AgentError {
        match err {
            BackendError::Authentication(reason) => {
                log::warn!("{} rejected the API key: {reason}", self.entry.title());
                self.entry.request_reauth();
                AgentError::Auth {
                    entry: self.entry.title().to_string(),
                }
            }
            other => AgentError::Api {
                entry: self.entry.title().to_string(),
                error: other.to_string(),
            },
        }
    }

    /// Generate an answer for the chat log
    pub async fn handle_chat_log(
        &self,
        chat_log: &mut ChatLog,
        mut options: ChatOptions<'_>,
    ) -> Result<(), AgentError> {
        let mut request = self.base_request();
        request.messages = chat_log
            .content()
            .iter()
            .filter_map(to_chat_message)
            .collect();

        if let Some(Content::User(last)) = chat_log.content().last() {
            if !last.attachments.is_empty() {
                let files = prepare_files_for_prompt(&last.attachments).await?;
                attach_to_last_user_message(&mut request.messages, &last.content, files);
            }
        }

        request.response_format = options.response_format.take();

        for iteration in 0..self.policy.max_iterations {
            log::debug!(
                "{}: backend round trip {} with {} messages",
                self.entity_id,
                iteration + 1,
                request.messages.len()
            );

            let completion = if options.stream {
                self.stream_completion(&request, chat_log, options.transform.is_none())
                    .await?
            } else {
                let completion = self
                    .entry
                    .backend()
                    .complete(&request)
                    .await
                    .map_err(|err| self.map_backend_error(err))?;
                if options.transform.is_none() {
                    if let Some(text) = &completion.content {
                        chat_log.emit_delta(text);
                    }
                }
                completion
            };

            let content = match (options.transform.as_deref_mut(), completion.content) {
                (Some(transform), raw) => {
                    let visible = transform.transform(raw.as_deref().unwrap_or_default());
                    chat_log.emit_delta(&visible);
                    Some(visible)
                }
                (None, content) => content,
            };

            let added = chat_log
                .add_assistant_content(AssistantContent {
                    agent_id: self.entity_id.clone(),
                    content,
                    tool_calls: completion.tool_calls,
                })
                .await;
            let replies = added.iter().filter_map(to_chat_message);
            request.messages.extend(replies);

            if !chat_log.unresponded_tool_results() {
                return Ok(());
            }
        }

        match self.policy.on_exhausted {
            IterationLimitPolicy::Stop => {
                log::warn!(
                    "{}: stopped after {} backend round trips with unanswered tool results",
                    self.entity_id,
                    self.policy.max_iterations
                );
                Ok(())
            }
            IterationLimitPolicy::Error => {
                Err(AgentError::IterationLimit(self.policy.max_iterations))
            }
        }
    }

    async fn stream_completion(
        &self,
        request: &ChatRequest,
        chat_log: &ChatLog,
        forward_deltas: bool,
    ) -> Result<Completion, AgentError> {
        let mut chunks = self
            .entry
            .backend()
            .stream(request)
            .await
            .map_err(|err| self.map_backend_error(err))?;

        let mut text = String::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|err| self.map_backend_error(err))?;
            if forward_deltas {
                chat_log.emit_delta(&chunk);
            }
            text.push_str(&chunk);
        }

        Ok(Completion {
            content: Some(text),
            tool_calls: Vec::new(),
        })
    }
}

/// Convert a chat-log entry to the backend message format
pub fn to_chat_message(content: &Content) -> Option<ChatMessage> {
    match content {
        Content::ToolResult(result) => {
            Some(ChatMessage::text("tool", result.tool_result.to_string()))
        }
        Content::System { content } if !content.is_empty() => {
            Some(ChatMessage::text("system", content))
        }
        Content::User(user) if !user.content.is_empty() => {
            Some(ChatMessage::text("user", &user.content))
        }
        Content::Assistant(assistant) => Some(ChatMessage {
            role: "assistant".to_string(),
            content: assistant.content.clone().map(MessageContent::Text),
        }),
        other => {
            log::warn!(
                "Could not convert {} message for the backend: {other:?}",
                other.role()
            );
            None
        }
    }
}

fn attach_to_last_user_message(
    messages: &mut Vec<ChatMessage>,
    text: &str,
    files: Vec<ContentPart>,
) {
    let mut parts = Vec::with_capacity(files.len() + 1);
    parts.push(ContentPart::Text {
        text: text.to_string(),
    });
    parts.extend(files);

    match messages.last_mut() {
        Some(last) if last.role == "user" => last.content = Some(MessageContent::Parts(parts)),
        _ => messages.push(ChatMessage {
            role: "user".to_string(),
            content: Some(MessageContent::Parts(parts)),
        }),
    }
}

/// Base64-encode image attachments as `image_url` parts
pub async fn prepare_files_for_prompt(
    attachments: &[Attachment],
) -> Result<Vec<ContentPart>, AgentError> {
    let mut parts = Vec::with_capacity(attachments.len());

    for attachment in attachments {
        let path: &PathBuf = &attachment.path;
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(AgentError::FileNotFound(path.clone()));
        }

        let guessed = || mime_guess::from_path(path).first_raw().map(str::to_string);
        let mime_type = match attachment.mime_type.clone().or_else(guessed) {
            Some(mime) if mime.starts_with("image/") => mime,
            _ => return Err(AgentError::UnsupportedFileType(path.clone())),
        };

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|_| AgentError::FileNotFound(path.clone()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        parts.push(ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{mime_type};base64,{encoded}"),
            },
        });
    }

    Ok(parts)
}

/// Make every property required, nullable when it was optional
pub fn adjust_schema(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    match obj.get("type").and_then(Value::as_str) {
        Some("object") => {
            if !obj.contains_key("properties") {
                return;
            }

            let mut required = match obj.remove("required") {
                Some(Value::Array(required)) => required,
                _ => Vec::new(),
            };

            if let Some(Value::Object(properties)) = obj.get_mut("properties") {
                for (name, prop) in properties.iter_mut() {
                    adjust_schema(prop);
                    if required.iter().any(|r| r.as_str() == Some(name.as_str())) {
                        continue;
                    }
                    if let Some(prop) = prop.as_object_mut() {
                        let ty = prop.remove("type").unwrap_or(Value::Null);
                        prop.insert("type".to_string(), json!([ty, "null"]));
                    }
                    required.push(Value::String(name.clone()));
                }
            }

            obj.insert("required".to_string(), Value::Array(required));
        }
        Some("array") => {
            if let Some(items) = obj.get_mut("items") {
                adjust_schema(items);
            }
        }
        _ => {}
    }
}

/// Strict `json_schema` response format for a task structure
pub fn format_structured_output(name: &str, schema: &Value) -> Value {
    let mut schema = schema.clone();
    adjust_schema(&mut schema);
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": name,
            "strict": true,
            "schema": schema,
        }
    })
}
