//! Output formatting utilities
//!
//! Handles JSON, YAML, and table output formats.

use std::io::IsTerminal;

use anyhow::Result;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use crate::cli::OutputFormat;
use crate::config::RuntimeContext;

/// Format and print data according to the configured output format
pub fn print_output<T: Serialize>(ctx: &RuntimeContext, data: &T) -> Result<()> {
    let output = format_output(ctx, data)?;
    println!("{output}");
    Ok(())
}

/// Format data according to the configured output format
pub fn format_output<T: Serialize>(ctx: &RuntimeContext, data: &T) -> Result<String> {
    let format = ctx.output_format();
    let is_tty = std::io::stdout().is_terminal();

    match format {
        OutputFormat::Json => {
            if is_tty {
                Ok(serde_json::to_string_pretty(data)?)
            } else {
                Ok(serde_json::to_string(data)?)
            }
        }
        OutputFormat::Yaml => Ok(serde_yaml::to_string(data)?),
        OutputFormat::Table | OutputFormat::Auto => {
            if !is_tty && matches!(format, OutputFormat::Auto) {
                Ok(serde_json::to_string(data)?)
            } else {
                Ok(serde_json::to_string_pretty(data)?)
            }
        }
    }
}

/// True when output goes to a person rather than a program
pub fn is_human_output(ctx: &RuntimeContext) -> bool {
    match ctx.output_format() {
        OutputFormat::Table => true,
        OutputFormat::Auto => std::io::stdout().is_terminal(),
        _ => false,
    }
}

/// Print items as a table, or serialized when a machine format is requested
pub fn print_table<T: Tabled + Serialize>(ctx: &RuntimeContext, items: &[T]) -> Result<()> {
    if !is_human_output(ctx) {
        return print_output(ctx, &items);
    }

    let table = build_table(ctx, items);
    println!("{table}");
    Ok(())
}

fn build_table<T: Tabled>(ctx: &RuntimeContext, items: &[T]) -> Table {
    let mut table = Table::new(items);
    table.with(Style::sharp());

    if ctx.global.no_headers || ctx.config.output.no_headers {
        table.with(tabled::settings::Remove::row(
            tabled::settings::object::Rows::first(),
        ));
    }

    table
}

/// Parse JSON input from various sources (inline, @file, - for stdin)
pub fn parse_json_input(input: &str) -> Result<serde_json::Value> {
    let input = input.trim();

    if input == "-" {
        use std::io::Read;
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        return Ok(serde_json::from_str(&buffer)?);
    }

    if let Some(path) = input.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&content)?);
    }

    Ok(serde_json::from_str(input)?)
}
