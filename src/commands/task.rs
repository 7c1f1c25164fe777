//! AI task command

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use super::{agents, new_conversation_id, reauth_hint, start_entry, task_agent};
use crate::ai_task::GenDataTask;
use crate::chat_log::ChatLog;
use crate::cli::TaskCommand;
use crate::config::{AgentKind, RuntimeContext};
use crate::output::{is_human_output, parse_json_input, print_output};

pub async fn run(ctx: &RuntimeContext, cmd: TaskCommand) -> Result<()> {
    let settings = agents::resolve(
        &ctx.config.agents,
        cmd.agent.as_deref(),
        AgentKind::AiTaskData,
    )?;
    let structure = cmd
        .structure
        .as_deref()
        .map(parse_json_input)
        .transpose()
        .context("parsing --structure")?;

    let entry = start_entry(ctx).await?;
    let agent = task_agent(ctx, entry.clone(), settings);

    let task = GenDataTask {
        name: cmd.name,
        instructions: cmd.instructions.join(" "),
        structure,
        attachments: cmd.attachments,
    };
    let mut chat_log = ChatLog::new(new_conversation_id());
    let result = agent
        .generate_data(&task, &mut chat_log)
        .await
        .map_err(|err| anyhow!("{err}{}", reauth_hint(&entry)))?;

    match &result.data {
        Value::String(text) if is_human_output(ctx) => println!("{text}"),
        _ => print_output(ctx, &result)?,
    }
    Ok(())
}
