//! Credential check, the config-flow validation step

use anyhow::{bail, Result};
use serde_json::json;

use super::backend;
use crate::config::RuntimeContext;
use crate::output::{is_human_output, print_output};
use crate::setup::{validate_input, ValidationResult};

pub async fn run(ctx: &RuntimeContext) -> Result<()> {
    let backend = backend(ctx)?;
    let result = validate_input(backend.as_ref()).await;

    if is_human_output(ctx) {
        println!("{}", result.as_str());
    } else {
        print_output(ctx, &json!({ "result": result.as_str() }))?;
    }

    match result {
        ValidationResult::Ok => Ok(()),
        ValidationResult::InvalidAuth => bail!("Perplexity rejected the API key"),
        ValidationResult::CannotConnect => bail!("Could not reach the Perplexity API"),
    }
}
