//! Interactive multi-turn conversation

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use super::{
    agents, conversation_agent, new_conversation_id, print_delta, reauth_hint, start_entry,
};
use crate::chat_log::ChatLog;
use crate::cli::ChatCommand;
use crate::config::{AgentKind, RuntimeContext};
use crate::conversation::{ConversationAgent, ConversationInput, ConversationResult, ResponseType};
use crate::output::{is_human_output, print_output};

pub async fn run(ctx: &RuntimeContext, cmd: ChatCommand) -> Result<()> {
    let settings = agents::resolve(
        &ctx.config.agents,
        cmd.agent.as_deref(),
        AgentKind::Conversation,
    )?;
    let entry = start_entry(ctx).await?;
    let agent = conversation_agent(ctx, Arc::clone(&entry), settings)?;

    let human = is_human_output(ctx);
    let mut chat_log = ChatLog::new(new_conversation_id());
    if human {
        chat_log = chat_log.with_delta_listener(print_delta);
        eprintln!(
            "Chatting with {} ({}). Type 'exit' or press Ctrl+D to quit.",
            settings.name,
            agent.entity_id()
        );
    }

    let session = ChatSession {
        agent: &agent,
        extra_prompt: cmd.extra_prompt.as_deref(),
        human,
    };
    let lines = BufReader::new(tokio::io::stdin()).lines();
    session
        .run(&mut chat_log, lines, |result| {
            if !human {
                print_output(ctx, result)
            } else {
                if result.response.response_type == ResponseType::Error {
                    eprintln!("Error: {}{}", result.response.speech, reauth_hint(&entry));
                } else {
                    println!();
                }
                Ok(())
            }
        })
        .await
}

struct ChatSession<'a> {
    agent: &'a ConversationAgent,
    extra_prompt: Option<&'a str>,
    human: bool,
}

impl ChatSession<'_> {
    /// Run turns until end of input, `exit`, or Ctrl+C. The agent is removed
    /// on every way out, including errors.
    async fn run<R: AsyncBufRead + Unpin>(
        &self,
        chat_log: &mut ChatLog,
        mut lines: Lines<R>,
        mut report: impl FnMut(&ConversationResult) -> Result<()>,
    ) -> Result<()> {
        let _teardown = Teardown(self.agent);

        loop {
            if self.human {
                print!("> ");
                io::stdout().flush()?;
            }

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                return Ok(());
            };

            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            if matches!(text, "exit" | "quit") {
                return Ok(());
            }

            let input = ConversationInput {
                text: text.to_string(),
                extra_system_prompt: self.extra_prompt.map(str::to_string),
            };
            let result = self.agent.handle_message(&input, chat_log).await;
            report(&result)?;
        }
    }
}

struct Teardown<'a>(&'a ConversationAgent);

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        let pending = self.0.executor().pending_count();
        self.0.remove();
        if pending > 0 {
            log::warn!("Cancelled {pending} delayed action(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::agent::tests::{agent_settings, core, ScriptedBackend};
    use crate::agent::LoopPolicy;
    use crate::commands::NoHomeAssistant;
    use crate::scheduler::tests::RecordingControl;

    const DELAYED_OFF: &str = r#"{"response":"Off in an hour.","actions":[{"domain":"light","service":"turn_off","target":"light.desk","data":null,"delay_seconds":3600}]}"#;

    fn agent(replies: &[&str]) -> (Arc<RecordingControl>, ConversationAgent) {
        let mut settings = agent_settings("sonar");
        settings.llm_hass_api = vec!["assist".to_string()];
        let control = Arc::new(RecordingControl::default());
        let agent = ConversationAgent::new(
            core(
                Arc::new(ScriptedBackend::text(replies)),
                settings,
                LoopPolicy::default(),
            ),
            control.clone(),
            Arc::new(NoHomeAssistant),
            50,
        );
        (control, agent)
    }

    fn session(agent: &ConversationAgent) -> ChatSession<'_> {
        ChatSession {
            agent,
            extra_prompt: None,
            human: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_cancels_pending_actions() {
        let (control, agent) = agent(&[DELAYED_OFF]);
        let mut log = ChatLog::new("conv-1");
        let input: &[u8] = b"turn off the desk light in an hour\n\nexit\nnever read\n";
        let mut replies = Vec::new();

        session(&agent)
            .run(&mut log, BufReader::new(input).lines(), |result| {
                replies.push(result.response.speech.clone());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(replies, vec!["Off in an hour."]);
        assert_eq!(agent.executor().pending_count(), 0);
        tokio::time::sleep(Duration::from_secs(3700)).await;
        assert!(control.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_still_cancels_pending_actions() {
        let (control, agent) = agent(&[DELAYED_OFF]);
        let mut log = ChatLog::new("conv-1");
        let input: &[u8] = b"turn off the desk light in an hour\n\xff\xfe\n";

        let outcome = session(&agent)
            .run(&mut log, BufReader::new(input).lines(), |_| Ok(()))
            .await;

        assert!(outcome.is_err());
        assert_eq!(agent.executor().pending_count(), 0);
        tokio::time::sleep(Duration::from_secs(3700)).await;
        assert!(control.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_error_still_cancels_pending_actions() {
        let (_, agent) = agent(&[DELAYED_OFF]);
        let mut log = ChatLog::new("conv-1");
        let input: &[u8] = b"turn off the desk light in an hour\n";

        let outcome = session(&agent)
            .run(&mut log, BufReader::new(input).lines(), |_| {
                anyhow::bail!("stdout closed")
            })
            .await;

        assert!(outcome.is_err());
        assert_eq!(agent.executor().pending_count(), 0);
    }
}
