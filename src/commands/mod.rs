//! Command implementations

pub mod agents;
pub mod ask;
pub mod chat;
pub mod check;
pub mod completions;
pub mod config;
pub mod diagnostics;
pub mod task;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::agent::AgentCore;
use crate::ai_task::AiTaskAgent;
use crate::api::HassClient;
use crate::backend::{ChatBackend, PerplexityClient};
use crate::config::{AgentConfig, RuntimeContext};
use crate::conversation::{ConversationAgent, EntityInventory};
use crate::error::SetupError;
use crate::inventory::HassInventory;
use crate::prompt::{ExposedEntity, HomeLocation};
use crate::scheduler::ControlPlane;
use crate::setup::{setup_entry_with_retry, EntryRuntime};

pub(crate) const ENTRY_TITLE: &str = "Perplexity";

const KEY_HINT: &str =
    "Hint: update the API key via --api-key, PERPLEXITY_API_KEY, or the config file";

pub(crate) fn backend(ctx: &RuntimeContext) -> Result<Arc<dyn ChatBackend>> {
    let client = PerplexityClient::new(
        ctx.api_key()?,
        &ctx.config.perplexity.base_url,
        ctx.backend_timeout(),
    )?;
    Ok(Arc::new(client))
}

/// Validate the credential and build the shared entry runtime
pub(crate) async fn start_entry(ctx: &RuntimeContext) -> Result<Arc<EntryRuntime>> {
    let backend = backend(ctx)?;
    setup_entry_with_retry(ENTRY_TITLE, backend, ctx.retry_schedule())
        .await
        .map_err(|err| match err {
            SetupError::AuthFailed { .. } => anyhow!("{err}\n{KEY_HINT}"),
            other => anyhow!(other),
        })
}

/// Stand-in when no Home Assistant connection is configured
struct NoHomeAssistant;

#[async_trait]
impl ControlPlane for NoHomeAssistant {
    async fn call_service(&self, domain: &str, service: &str, _data: &Value) -> Result<()> {
        Err(anyhow!(
            "cannot call {domain}.{service}: no Home Assistant server configured"
        ))
    }
}

#[async_trait]
impl EntityInventory for NoHomeAssistant {
    async fn exposed_entities(&self) -> Result<Vec<ExposedEntity>> {
        Ok(Vec::new())
    }

    async fn home_location(&self) -> Result<HomeLocation> {
        Ok(HomeLocation::default())
    }
}

fn core(ctx: &RuntimeContext, entry: Arc<EntryRuntime>, settings: &AgentConfig) -> AgentCore {
    AgentCore::new(
        entry,
        settings.clone(),
        settings.entity_id(),
        ctx.loop_policy(),
    )
}

pub(crate) fn conversation_agent(
    ctx: &RuntimeContext,
    entry: Arc<EntryRuntime>,
    settings: &AgentConfig,
) -> Result<ConversationAgent> {
    let needs_home = !settings.llm_hass_api.is_empty() || settings.include_home_location;

    let (control, inventory): (Arc<dyn ControlPlane>, Arc<dyn EntityInventory>) =
        match (ctx.server_url(), ctx.token()) {
            (Ok(server), Ok(token)) => {
                let rest = Arc::new(HassClient::from_context(ctx)?);
                let inventory = HassInventory::new(
                    Arc::clone(&rest),
                    server,
                    token,
                    ctx.config.homeassistant.location_overrides(),
                );
                (rest as Arc<dyn ControlPlane>, Arc::new(inventory) as Arc<dyn EntityInventory>)
            }
            (Err(err), _) | (_, Err(err)) if needs_home => return Err(err),
            _ => (
                Arc::new(NoHomeAssistant) as Arc<dyn ControlPlane>,
                Arc::new(NoHomeAssistant) as Arc<dyn EntityInventory>,
            ),
        };

    Ok(ConversationAgent::new(
        core(ctx, entry, settings),
        control,
        inventory,
        ctx.config.conversation.max_entities,
    ))
}

pub(crate) fn task_agent(
    ctx: &RuntimeContext,
    entry: Arc<EntryRuntime>,
    settings: &AgentConfig,
) -> AiTaskAgent {
    AiTaskAgent::new(core(ctx, entry, settings))
}

/// Conversation id for a new session
pub(crate) fn new_conversation_id() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S%3f").to_string()
}

/// Print visible assistant text as it arrives
pub(crate) fn print_delta(text: &str) {
    use std::io::Write;

    let mut stdout = std::io::stdout();
    let _ = write!(stdout, "{text}");
    let _ = stdout.flush();
}

pub(crate) fn reauth_hint(entry: &EntryRuntime) -> String {
    if entry.reauth_requested() {
        format!("\nThe API key was rejected. {KEY_HINT}")
    } else {
        String::new()
    }
}
