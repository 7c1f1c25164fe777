//! Diagnostics command

use anyhow::Result;

use super::ENTRY_TITLE;
use crate::config::RuntimeContext;
use crate::diagnostics::config_entry_diagnostics;
use crate::output::print_output;

pub fn run(ctx: &RuntimeContext) -> Result<()> {
    let diagnostics = config_entry_diagnostics(ENTRY_TITLE, &ctx.config)?;
    print_output(ctx, &diagnostics)
}
