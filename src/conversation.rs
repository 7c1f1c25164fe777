//! Conversation agent
//!
//! Without a control API configured the agent is a plain chat agent. With
//! one, every turn runs in action mode:
//!
//! 1. the system prompt gains the action grammar and a snapshot of the
//!    exposed entities,
//! 2. one streamed request is made with the structured response directive,
//! 3. the buffered text is parsed and only the reply enters the chat log,
//! 4. the parsed actions run in order (delayed ones are scheduled).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::action::ParsedTurn;
use crate::agent::{AgentCore, ChatOptions, ResponseTransform};
use crate::chat_log::{ChatLog, LlmData, UserContent};
use crate::error::{AgentError, ConverseError};
use crate::parser::parse_response;
use crate::prompt::{
    action_response_format, build_system_addendum, extra_system_prompt, home_location_prompt,
    ExposedEntity, HomeLocation, ACTION_INSTRUCTIONS,
};
use crate::scheduler::{ActionExecutor, ControlPlane};

/// Read access to what the assistant may see of the home
#[async_trait]
pub trait EntityInventory: Send + Sync {
    async fn exposed_entities(&self) -> anyhow::Result<Vec<ExposedEntity>>;

    async fn home_location(&self) -> anyhow::Result<HomeLocation>;
}

/// One user utterance
#[derive(Debug, Clone, Default)]
pub struct ConversationInput {
    pub text: String,
    pub extra_system_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    ActionDone,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentResponse {
    pub response_type: ResponseType,
    pub speech: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationResult {
    pub response: IntentResponse,
    pub conversation_id: String,
    pub continue_conversation: bool,
}

impl ConversationResult {
    fn error(chat_log: &ChatLog, message: String) -> Self {
        Self {
            response: IntentResponse {
                response_type: ResponseType::Error,
                speech: message,
                error_code: Some("unknown".to_string()),
            },
            conversation_id: chat_log.conversation_id().to_string(),
            continue_conversation: false,
        }
    }

    /// Result carrying the last assistant message of the chat log
    fn from_chat_log(chat_log: &ChatLog) -> Self {
        let speech = chat_log.last_assistant_text().unwrap_or("").to_string();
        let continue_conversation = speech.trim_end().ends_with('?');
        Self {
            response: IntentResponse {
                response_type: ResponseType::ActionDone,
                speech,
                error_code: None,
            },
            conversation_id: chat_log.conversation_id().to_string(),
            continue_conversation,
        }
    }
}

impl ConverseError {
    pub fn as_conversation_result(&self, chat_log: &ChatLog) -> ConversationResult {
        ConversationResult::error(chat_log, self.message.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPhase {
    Init,
    LlmDataProvisioned,
    BackendRoundTrip,
    Parsed,
    Executed,
    Done,
    Errored,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnPhase::Init => "init",
            TurnPhase::LlmDataProvisioned => "llm-data-provisioned",
            TurnPhase::BackendRoundTrip => "backend-round-trip",
            TurnPhase::Parsed => "parsed",
            TurnPhase::Executed => "executed",
            TurnPhase::Done => "done",
            TurnPhase::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Buffers the model output and keeps the parsed turn for execution
#[derive(Default)]
struct ActionExtractor {
    parsed: Option<ParsedTurn>,
}

impl ResponseTransform for ActionExtractor {
    fn transform(&mut self, raw: &str) -> String {
        let parsed = parse_response(raw);
        let reply = parsed.reply_text.clone();
        if self.parsed.is_some() {
            log::warn!("Ignoring actions from a later model response in this turn");
        } else {
            self.parsed = Some(parsed);
        }
        reply
    }
}

pub struct ConversationAgent {
    core: AgentCore,
    executor: ActionExecutor,
    inventory: Arc<dyn EntityInventory>,
    max_entities: usize,
}

impl ConversationAgent {
    pub fn new(
        core: AgentCore,
        control: Arc<dyn ControlPlane>,
        inventory: Arc<dyn EntityInventory>,
        max_entities: usize,
    ) -> Self {
        Self {
            core,
            executor: ActionExecutor::new(control),
            inventory,
            max_entities,
        }
    }

    pub fn entity_id(&self) -> &str {
        self.core.entity_id()
    }

    /// Whether this agent may control devices
    pub fn supports_control(&self) -> bool {
        !self.core.settings().llm_hass_api.is_empty()
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    fn phase(&self, phase: TurnPhase) {
        log::debug!("{}: turn {}", self.core.entity_id(), phase);
    }

    /// Process one user utterance against the chat log
    pub async fn handle_message(
        &self,
        input: &ConversationInput,
        chat_log: &mut ChatLog,
    ) -> ConversationResult {
        self.phase(TurnPhase::Init);
        chat_log.add_user_content(UserContent {
            content: input.text.clone(),
            attachments: Vec::new(),
        });

        let caller = input.extra_system_prompt.as_deref();
        let extra = self.build_extra_system_prompt(caller).await;

        let result = if self.supports_control() {
            self.handle_with_actions(chat_log, extra.as_deref()).await
        } else {
            self.handle_plain(chat_log, extra.as_deref()).await
        };

        match result {
            Ok(result) => {
                self.phase(TurnPhase::Done);
                result
            }
            Err(err) => {
                self.phase(TurnPhase::Errored);
                log::error!("{}: {err}", self.core.entity_id());
                ConversationResult::error(chat_log, err.to_string())
            }
        }
    }

    async fn handle_plain(
        &self,
        chat_log: &mut ChatLog,
        extra: Option<&str>,
    ) -> Result<ConversationResult, AgentError> {
        let settings = self.core.settings();
        if let Err(err) = chat_log.provide_llm_data(LlmData {
            user_prompt: settings.prompt.as_deref(),
            llm_api_ids: &[],
            extra_system_prompt: extra,
        }) {
            self.phase(TurnPhase::Errored);
            return Ok(err.as_conversation_result(chat_log));
        }
        self.phase(TurnPhase::LlmDataProvisioned);

        self.phase(TurnPhase::BackendRoundTrip);
        self.core
            .handle_chat_log(
                chat_log,
                ChatOptions {
                    stream: true,
                    ..Default::default()
                },
            )
            .await?;

        Ok(ConversationResult::from_chat_log(chat_log))
    }

    async fn handle_with_actions(
        &self,
        chat_log: &mut ChatLog,
        extra: Option<&str>,
    ) -> Result<ConversationResult, AgentError> {
        let settings = self.core.settings();
        let entities = match self.inventory.exposed_entities().await {
            Ok(entities) => entities,
            Err(err) => {
                return Err(AgentError::Api {
                    entry: "Home Assistant".to_string(),
                    error: format!("reading exposed entities: {err:#}"),
                });
            }
        };
        let addendum =
            build_system_addendum(extra, ACTION_INSTRUCTIONS, &entities, self.max_entities);

        if let Err(err) = chat_log.provide_llm_data(LlmData {
            user_prompt: settings.prompt.as_deref(),
            llm_api_ids: &settings.llm_hass_api,
            extra_system_prompt: Some(addendum.as_str()),
        }) {
            self.phase(TurnPhase::Errored);
            return Ok(err.as_conversation_result(chat_log));
        }
        self.phase(TurnPhase::LlmDataProvisioned);

        self.phase(TurnPhase::BackendRoundTrip);
        let mut extractor = ActionExtractor::default();
        self.core
            .handle_chat_log(
                chat_log,
                ChatOptions {
                    response_format: Some(action_response_format().clone()),
                    stream: true,
                    transform: Some(&mut extractor),
                },
            )
            .await?;
        self.phase(TurnPhase::Parsed);

        if let Some(parsed) = extractor.parsed {
            if !parsed.actions.is_empty() {
                log::debug!(
                    "{}: executing {} action(s)",
                    self.core.entity_id(),
                    parsed.actions.len()
                );
            }
            self.executor.execute_all(&parsed.actions).await;
        }
        self.phase(TurnPhase::Executed);

        Ok(ConversationResult::from_chat_log(chat_log))
    }

    async fn build_extra_system_prompt(&self, caller: Option<&str>) -> Option<String> {
        let location = if self.core.settings().include_home_location {
            match self.inventory.home_location().await {
                Ok(location) => home_location_prompt(&location),
                Err(err) => {
                    log::warn!("Could not read home location: {err:#}");
                    None
                }
            }
        } else {
            None
        };

        extra_system_prompt(location.as_deref(), caller)
    }

    /// Tear down: cancel every scheduled action
    pub fn remove(&self) {
        self.executor.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::agent::tests::{agent_settings, core, ScriptedBackend};
    use crate::agent::LoopPolicy;
    use crate::backend::{ChatRequest, MessageContent};
    use crate::chat_log::Content;
    use crate::config::AgentConfig;
    use crate::scheduler::tests::RecordingControl;

    struct StaticInventory {
        entities: Vec<ExposedEntity>,
        location: HomeLocation,
    }

    #[async_trait]
    impl EntityInventory for StaticInventory {
        async fn exposed_entities(&self) -> anyhow::Result<Vec<ExposedEntity>> {
            Ok(self.entities.clone())
        }

        async fn home_location(&self) -> anyhow::Result<HomeLocation> {
            Ok(self.location.clone())
        }
    }

    /// Home Assistant is unreachable
    struct UnavailableInventory;

    #[async_trait]
    impl EntityInventory for UnavailableInventory {
        async fn exposed_entities(&self) -> anyhow::Result<Vec<ExposedEntity>> {
            anyhow::bail!("connection refused")
        }

        async fn home_location(&self) -> anyhow::Result<HomeLocation> {
            anyhow::bail!("connection refused")
        }
    }

    fn inventory() -> Arc<StaticInventory> {
        Arc::new(StaticInventory {
            entities: vec![ExposedEntity {
                entity_id: "light.living_room".to_string(),
                names: "living room".to_string(),
                domain: "light".to_string(),
                state: "off".to_string(),
                areas: None,
            }],
            location: HomeLocation {
                latitude: Some(48.8566),
                longitude: Some(2.3522),
                country: Some("FR".to_string()),
            },
        })
    }

    fn control_settings() -> AgentConfig {
        let mut settings = agent_settings("sonar");
        settings.llm_hass_api = vec!["assist".to_string()];
        settings
    }

    fn agent(
        replies: &[&str],
        settings: AgentConfig,
    ) -> (Arc<ScriptedBackend>, Arc<RecordingControl>, ConversationAgent) {
        let backend = Arc::new(ScriptedBackend::text(replies));
        let control = Arc::new(RecordingControl::default());
        let agent = ConversationAgent::new(
            core(backend.clone(), settings, LoopPolicy::default()),
            control.clone(),
            inventory(),
            50,
        );
        (backend, control, agent)
    }

    fn input(text: &str) -> ConversationInput {
        ConversationInput {
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn system_text(request: &ChatRequest) -> &str {
        match &request.messages[0].content {
            Some(MessageContent::Text(text)) => text,
            other => panic!("expected system text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plain_conversation() {
        let (backend, control, agent) = agent(&["Hello! How can I help?"], agent_settings("sonar"));
        let mut log = ChatLog::new("conv-1");

        let result = agent.handle_message(&input("Hello"), &mut log).await;

        assert!(!agent.supports_control());
        assert_eq!(result.response.response_type, ResponseType::ActionDone);
        assert_eq!(result.response.speech, "Hello! How can I help?");
        assert!(result.continue_conversation);
        assert_eq!(result.conversation_id, "conv-1");

        let (request, stream) = &backend.requests()[0];
        assert!(*stream);
        assert!(request.response_format.is_none());
        assert!(!system_text(request).contains(ACTION_INSTRUCTIONS));
        assert!(control.calls().is_empty());
    }

    #[tokio::test]
    async fn test_plain_conversation_does_not_parse_json() {
        let raw = r#"{"response":"hi","actions":[{"domain":"light","service":"turn_on","target":"light.living_room","data":null}]}"#;
        let (_, control, agent) = agent(&[raw], agent_settings("sonar"));
        let mut log = ChatLog::new("conv-1");

        let result = agent.handle_message(&input("Hello"), &mut log).await;

        assert_eq!(result.response.speech, raw);
        assert!(control.calls().is_empty());
    }

    #[tokio::test]
    async fn test_action_turn_executes_and_hides_json() {
        let raw = r#"{"response":"Turned on the light.","actions":[{"domain":"light","service":"turn_on","target":"light.living_room","data":null}]}"#;
        let (backend, control, agent) = agent(&[raw], control_settings());
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        let mut log = ChatLog::new("conv-1").with_delta_listener(move |text| {
            sink.lock().unwrap().push(text.to_string());
        });

        let result = agent
            .handle_message(&input("Turn on the living room light"), &mut log)
            .await;

        assert!(agent.supports_control());
        assert_eq!(result.response.response_type, ResponseType::ActionDone);
        assert_eq!(result.response.speech, "Turned on the light.");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["Turned on the light.".to_string()]
        );
        assert_eq!(
            control.calls(),
            vec![(
                "light".to_string(),
                "turn_on".to_string(),
                json!({"entity_id": "light.living_room"})
            )]
        );

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        let (request, stream) = &requests[0];
        assert!(*stream);
        assert_eq!(
            request.response_format.as_ref(),
            Some(action_response_format())
        );
        let system = system_text(request);
        assert!(system.contains(ACTION_INSTRUCTIONS));
        let entity_yaml =
            "entities:\n  light.living_room:\n    names: living room\n    domain: light\n";
        assert!(system.contains(entity_yaml));
        assert_eq!(
            request.messages[1].content,
            Some(MessageContent::Text(
                "Turn on the living room light".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_chat_log_keeps_reply_not_raw_json() {
        let first = r#"{"response":"Done.","actions":null}"#;
        let second = r#"{"response":"Still done.","actions":null}"#;
        let (backend, _, agent) = agent(&[first, second], control_settings());
        let mut log = ChatLog::new("conv-1");

        agent.handle_message(&input("one"), &mut log).await;
        agent.handle_message(&input("two"), &mut log).await;

        let messages = &backend.requests()[1].0.messages;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].role, "assistant");
        let reply = Some(MessageContent::Text("Done.".to_string()));
        assert_eq!(messages[2].content, reply);
        assert!(matches!(log.content().last(), Some(Content::Assistant(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_action_is_scheduled_not_awaited() {
        let raw = r#"{"response":"The light will turn off in 5 minutes.","actions":[{"domain":"light","service":"turn_off","target":"light.living_room","data":null,"delay_seconds":300}]}"#;
        let (_, control, agent) = agent(&[raw], control_settings());
        let mut log = ChatLog::new("conv-1");

        let result = agent
            .handle_message(&input("Turn it off in 5 minutes"), &mut log)
            .await;

        assert_eq!(result.response.response_type, ResponseType::ActionDone);
        assert!(control.calls().is_empty());
        assert_eq!(agent.executor().pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(
            control.calls(),
            vec![(
                "light".to_string(),
                "turn_off".to_string(),
                json!({"entity_id": "light.living_room"})
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_cancels_pending_actions() {
        let raw = r#"{"response":"On for 30 minutes.","actions":[
            {"domain":"light","service":"turn_on","target":"light.living_room","data":null},
            {"domain":"light","service":"turn_off","target":"light.living_room","data":null,"delay_seconds":1800}
        ]}"#;
        let (_, control, agent) = agent(&[raw], control_settings());
        let mut log = ChatLog::new("conv-1");

        agent
            .handle_message(&input("Turn on the light for 30 minutes"), &mut log)
            .await;
        assert_eq!(control.calls().len(), 1);
        assert_eq!(agent.executor().pending_count(), 1);

        agent.remove();
        agent.remove();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(control.calls().len(), 1);
        assert_eq!(agent.executor().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_action_does_not_fail_turn() {
        let raw = r#"{"response":"Done.","actions":[
            {"domain":"light","service":"turn_on","target":"light.missing","data":null},
            {"domain":"light","service":"turn_on","target":"light.living_room","data":{"brightness":128}}
        ]}"#;
        let backend = Arc::new(ScriptedBackend::text(&[raw]));
        let control = Arc::new(RecordingControl::failing(&["light.missing"]));
        let agent = ConversationAgent::new(
            core(backend, control_settings(), LoopPolicy::default()),
            control.clone(),
            inventory(),
            50,
        );
        let mut log = ChatLog::new("conv-1");

        let result = agent.handle_message(&input("lights"), &mut log).await;

        assert_eq!(result.response.response_type, ResponseType::ActionDone);
        let calls = control.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].2,
            json!({"entity_id": "light.living_room", "brightness": 128})
        );
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_shown_verbatim() {
        let raw = "```json\n{invalid}\n```";
        let (_, control, agent) = agent(&[raw], control_settings());
        let mut log = ChatLog::new("conv-1");

        let result = agent.handle_message(&input("hm"), &mut log).await;

        assert_eq!(result.response.speech, raw);
        assert!(control.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_control_api_is_converse_error() {
        let mut settings = control_settings();
        settings.llm_hass_api = vec!["missing_api".to_string()];
        let (backend, _, agent) = agent(&["unused"], settings);
        let mut log = ChatLog::new("conv-1");

        let result = agent.handle_message(&input("hi"), &mut log).await;

        assert_eq!(result.response.response_type, ResponseType::Error);
        assert!(result.response.speech.contains("missing_api"));
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_is_error_result() {
        let (_, control, agent) = agent(&[], control_settings());
        let mut log = ChatLog::new("conv-1");

        let result = agent.handle_message(&input("hi"), &mut log).await;

        assert_eq!(result.response.response_type, ResponseType::Error);
        assert_eq!(result.response.error_code.as_deref(), Some("unknown"));
        assert!(control.calls().is_empty());
    }

    #[tokio::test]
    async fn test_home_location_in_system_prompt() {
        let mut settings = agent_settings("sonar");
        settings.include_home_location = true;
        let (backend, _, agent) = agent(&["Sunny."], settings);
        let mut log = ChatLog::new("conv-1");
        let turn = ConversationInput {
            text: "Weather?".to_string(),
            extra_system_prompt: Some("Be concise.".to_string()),
        };

        agent.handle_message(&turn, &mut log).await;

        let system = system_text(&backend.requests()[0].0).to_string();
        assert!(system.contains(
            "User's home location information:\nCoordinates: 48.857,2.352\nCountry: FR\nBe concise."
        ));
    }

    #[tokio::test]
    async fn test_inventory_failure_fails_action_turn() {
        let backend = Arc::new(ScriptedBackend::text(&["unused"]));
        let control = Arc::new(RecordingControl::default());
        let agent = ConversationAgent::new(
            core(backend.clone(), control_settings(), LoopPolicy::default()),
            control.clone(),
            Arc::new(UnavailableInventory),
            50,
        );
        let mut log = ChatLog::new("conv-1");

        let turn = input("Turn on the light");
        let result = agent.handle_message(&turn, &mut log).await;

        assert_eq!(result.response.response_type, ResponseType::Error);
        assert!(result.response.speech.contains("connection refused"));
        assert!(backend.requests().is_empty());
        assert!(control.calls().is_empty());
    }

    #[tokio::test]
    async fn test_home_location_failure_continues_turn() {
        let mut settings = agent_settings("sonar");
        settings.include_home_location = true;
        let backend = Arc::new(ScriptedBackend::text(&["Sunny."]));
        let agent = ConversationAgent::new(
            core(backend.clone(), settings, LoopPolicy::default()),
            Arc::new(RecordingControl::default()),
            Arc::new(UnavailableInventory),
            50,
        );
        let mut log = ChatLog::new("conv-1");

        let result = agent.handle_message(&input("Weather?"), &mut log).await;

        assert_eq!(result.response.response_type, ResponseType::ActionDone);
        assert_eq!(result.response.speech, "Sunny.");
        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        let system = system_text(&requests[0].0);
        assert!(!system.contains("User's home location information"));
    }

    #[test]
    fn test_extractor_keeps_first_parse() {
        let mut extractor = ActionExtractor::default();
        let first = r#"{"response":"a","actions":[{"domain":"light","service":"turn_on","target":"light.a","data":null}]}"#;
        let reply = extractor.transform(first);
        assert_eq!(reply, "a");
        let reply = extractor.transform(r#"{"response":"b","actions":null}"#);
        assert_eq!(reply, "b");
        assert_eq!(extractor.parsed.unwrap().actions.len(), 1);
    }
}
