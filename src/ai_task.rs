//! AI task entity: one-shot data generation
//!
//! Answers free text, or JSON conforming to a caller-supplied schema.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use crate::agent::{format_structured_output, AgentCore, ChatOptions};
use crate::chat_log::{Attachment, ChatLog, Content, LlmData, UserContent};
use crate::error::AgentError;

const AI_TASK_PROMPT: &str = "You are a Home Assistant expert and help users with their tasks.";

/// A generate-data request
#[derive(Debug, Clone, Default)]
pub struct GenDataTask {
    pub name: String,
    pub instructions: String,
    pub structure: Option<Value>,
    pub attachments: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenDataTaskResult {
    pub conversation_id: String,
    pub data: Value,
}

pub struct AiTaskAgent {
    core: AgentCore,
}

impl AiTaskAgent {
    pub fn new(core: AgentCore) -> Self {
        Self { core }
    }

    pub fn entity_id(&self) -> &str {
        self.core.entity_id()
    }

    pub async fn generate_data(
        &self,
        task: &GenDataTask,
        chat_log: &mut ChatLog,
    ) -> Result<GenDataTaskResult, AgentError> {
        let settings = self.core.settings();
        let prompt = settings.prompt.as_deref().unwrap_or(AI_TASK_PROMPT);
        chat_log
            .provide_llm_data(LlmData {
                user_prompt: Some(prompt),
                ..Default::default()
            })
            .map_err(|err| AgentError::Api {
                entry: self.core.entry().title().to_string(),
                error: err.message,
            })?;

        chat_log.add_user_content(UserContent {
            content: task.instructions.clone(),
            attachments: task
                .attachments
                .iter()
                .map(|path| Attachment {
                    path: path.clone(),
                    mime_type: None,
                })
                .collect(),
        });

        let response_format = task
            .structure
            .as_ref()
            .map(|schema| format_structured_output(&task.name, schema));

        self.core
            .handle_chat_log(
                chat_log,
                ChatOptions {
                    response_format,
                    ..Default::default()
                },
            )
            .await?;

        let text = match chat_log.content().last() {
            Some(Content::Assistant(assistant)) => assistant.content.clone().unwrap_or_default(),
            _ => return Err(AgentError::NoAssistantResponse),
        };

        let data = if task.structure.is_some() {
            serde_json::from_str(&text)
                .map_err(|err| AgentError::StructuredResponse(err.to_string()))?
        } else {
            Value::String(text)
        };

        Ok(GenDataTaskResult {
            conversation_id: chat_log.conversation_id().to_string(),
            data,
        })
    }
}
