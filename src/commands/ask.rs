//! Single-turn conversation

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use super::{
    agents, conversation_agent, new_conversation_id, print_delta, reauth_hint, start_entry,
};
use crate::chat_log::ChatLog;
use crate::cli::AskCommand;
use crate::config::{AgentKind, RuntimeContext};
use crate::conversation::{ConversationAgent, ConversationInput, ResponseType};
use crate::output::{is_human_output, print_output};

pub async fn run(ctx: &RuntimeContext, cmd: AskCommand) -> Result<()> {
    let settings = agents::resolve(
        &ctx.config.agents,
        cmd.agent.as_deref(),
        AgentKind::Conversation,
    )?;
    let entry = start_entry(ctx).await?;
    let agent = conversation_agent(ctx, Arc::clone(&entry), settings)?;

    let human = is_human_output(ctx);
    let mut chat_log = ChatLog::new(cmd.conversation_id.unwrap_or_else(new_conversation_id));
    if human {
        chat_log = chat_log.with_delta_listener(print_delta);
    }

    let input = ConversationInput {
        text: cmd.text.join(" "),
        extra_system_prompt: cmd.extra_prompt,
    };
    let result = agent.handle_message(&input, &mut chat_log).await;

    if human {
        if result.response.response_type == ResponseType::ActionDone {
            println!();
        }
    } else {
        print_output(ctx, &result)?;
    }

    settle(&agent, cmd.wait).await;

    if result.response.response_type == ResponseType::Error {
        bail!("{}{}", result.response.speech, reauth_hint(&entry));
    }
    Ok(())
}

/// Keep delayed actions alive for at most `wait`, then drop the rest
async fn settle(agent: &ConversationAgent, wait: Option<Duration>) {
    let pending = agent.executor().pending_count();
    if pending == 0 {
        return;
    }

    match wait {
        Some(limit) => {
            log::info!(
                "Waiting up to {} for {pending} delayed action(s)",
                humantime::format_duration(limit)
            );
            tokio::select! {
                settled = agent.executor().wait_idle(limit) => {
                    if !settled {
                        log::warn!("Gave up waiting for delayed actions");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    log::debug!("Received Ctrl+C, cancelling delayed actions");
                }
            }
        }
        None => log::warn!("Dropping {pending} delayed action(s) (see --wait)"),
    }

    agent.remove();
}
