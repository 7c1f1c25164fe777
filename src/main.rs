//! pplx-assist - Perplexity-backed conversation agent for Home Assistant
//!
//! Turns natural-language requests into a spoken reply plus Home Assistant
//! service calls, some of which may be scheduled for later.

mod action;
mod agent;
mod ai_task;
mod api;
mod backend;
mod chat_log;
mod cli;
mod commands;
mod config;
mod conversation;
mod diagnostics;
mod error;
mod inventory;
mod output;
mod parser;
mod prompt;
mod scheduler;
mod setup;
mod websocket;

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Command};
use crate::config::RuntimeContext;

fn main() -> ExitCode {
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = writeln!(io::stderr(), "Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = RuntimeContext::new(&cli.global)?;
    ctx.init_logging()?;

    log::debug!("Config loaded from: {:?}", ctx.config_path());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_command(&ctx, cli.command))
}

async fn run_command(ctx: &RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Ask(cmd) => commands::ask::run(ctx, cmd).await,
        Command::Chat(cmd) => commands::chat::run(ctx, cmd).await,
        Command::Task(cmd) => commands::task::run(ctx, cmd).await,
        Command::Check => commands::check::run(ctx).await,
        Command::Agents => commands::agents::run(ctx),
        Command::Diagnostics => commands::diagnostics::run(ctx),
        Command::Config { command } => commands::config::run(ctx, command),
        Command::Completions { shell } => commands::completions::run(shell),
    }
}
