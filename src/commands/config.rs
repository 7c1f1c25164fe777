//! Config command implementations
//!
//! Secrets are redacted in everything this command prints.

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::cli::ConfigCommand;
use crate::config::{self as app_config, AppConfig, RuntimeContext};
use crate::diagnostics::redact;
use crate::output::print_output;

const SECRETS: &[&str] = &["api_key", "token"];

pub fn run(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => print_output(ctx, &redacted(&ctx.config)?),
        ConfigCommand::Path => {
            println!("{}", ctx.config_path().display());
            Ok(())
        }
        ConfigCommand::Get { key: Some(key) } => {
            println!("{}", config_value(&ctx.config, &key)?);
            Ok(())
        }
        ConfigCommand::Get { key: None } => print_output(ctx, &redacted(&ctx.config)?),
        ConfigCommand::Reset => {
            app_config::write_default_config(ctx.config_path())?;
            println!(
                "Configuration reset to defaults at: {}",
                ctx.config_path().display()
            );
            Ok(())
        }
    }
}

fn redacted(config: &AppConfig) -> Result<Value> {
    let mut value = serde_json::to_value(config)?;
    redact(&mut value, SECRETS);
    Ok(value)
}

/// Look up a dot-separated key; numeric segments index into `agents`
fn config_value(config: &AppConfig, key: &str) -> Result<String> {
    let root = redacted(config)?;
    let found = key.split('.').try_fold(&root, |current, part| {
        let next = match (current, part.parse::<usize>()) {
            (Value::Array(items), Ok(index)) => items.get(index),
            _ => current.get(part),
        };
        next.ok_or_else(|| anyhow!("Configuration key not found: {key}"))
    })?;

    Ok(match found {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => serde_json::to_string(other)?,
    })
}
