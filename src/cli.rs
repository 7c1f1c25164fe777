//! CLI argument parsing and command definitions

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

/// Talk to a Perplexity-backed Home Assistant assistant
#[derive(Debug, Parser)]
#[command(
    name = "pplx-assist",
    author,
    version,
    about = "Perplexity-backed conversation agent for Home Assistant",
    propagate_version = true,
    after_help = "Use 'pplx-assist <command> --help' for more information about a command."
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,
    #[command(subcommand)]
    pub command: Command,
}

/// Global options available to all commands
#[derive(Debug, Clone, Args)]
pub struct GlobalOpts {
    /// Output format (json, yaml, table, auto)
    #[arg(
        short = 'o',
        long = "output",
        value_enum,
        global = true,
        conflicts_with = "json"
    )]
    pub output_format: Option<OutputFormat>,

    /// Output as JSON (shorthand for -o json)
    #[arg(long, global = true)]
    pub json: bool,

    /// Perplexity API key
    #[arg(long, env = "PERPLEXITY_API_KEY", global = true, hide_env_values = true)]
    pub api_key: Option<String>,

    /// Home Assistant server URL
    #[arg(short = 's', long, env = "HASS_SERVER", global = true)]
    pub server: Option<String>,

    /// Home Assistant access token
    #[arg(long, env = "HASS_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Home Assistant request timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Skip SSL certificate verification
    #[arg(long, global = true)]
    pub insecure: bool,

    /// Override config file path
    #[arg(long, value_name = "PATH", env = "PPLX_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Reduce output to only errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Increase logging verbosity (stackable: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Enable trace logging
    #[arg(long, global = true)]
    pub trace: bool,

    /// Disable colored output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Hide table headers
    #[arg(long, global = true)]
    pub no_headers: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[non_exhaustive]
pub enum OutputFormat {
    Json,
    Yaml,
    Table,
    Auto,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send one message to a conversation agent
    Ask(AskCommand),

    /// Interactive multi-turn conversation
    Chat(ChatCommand),

    /// Run an AI task that generates data
    Task(TaskCommand),

    /// Validate the Perplexity API key
    Check,

    /// List configured agents
    Agents,

    /// Print redacted diagnostics
    Diagnostics,

    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
pub struct AskCommand {
    /// What to say
    #[arg(required = true, value_name = "TEXT")]
    pub text: Vec<String>,

    /// Agent name (exact or fuzzy)
    #[arg(short, long)]
    pub agent: Option<String>,

    /// Conversation id to report back
    #[arg(long, value_name = "ID")]
    pub conversation_id: Option<String>,

    /// Extra system prompt for this turn
    #[arg(long, value_name = "TEXT")]
    pub extra_prompt: Option<String>,

    /// Stay alive until delayed actions fired, at most this long (e.g. "10m")
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub wait: Option<Duration>,
}

#[derive(Debug, Args)]
pub struct ChatCommand {
    /// Agent name (exact or fuzzy)
    #[arg(short, long)]
    pub agent: Option<String>,

    /// Extra system prompt for the whole session
    #[arg(long, value_name = "TEXT")]
    pub extra_prompt: Option<String>,
}

#[derive(Debug, Args)]
pub struct TaskCommand {
    /// Task instructions
    #[arg(required = true, value_name = "INSTRUCTIONS")]
    pub instructions: Vec<String>,

    /// Agent name (exact or fuzzy)
    #[arg(short, long)]
    pub agent: Option<String>,

    /// Task name, also the structured output name
    #[arg(long, default_value = "Generate data")]
    pub name: String,

    /// JSON schema of the result (inline, @file, or - for stdin)
    #[arg(long, value_name = "JSON")]
    pub structure: Option<String>,

    /// Image to attach (repeatable)
    #[arg(long = "attach", value_name = "FILE")]
    pub attachments: Vec<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show effective configuration
    Show,

    /// Print config file path
    Path,

    /// Get a specific configuration value
    Get {
        /// Configuration key (dot-separated path)
        key: Option<String>,
    },

    /// Reset configuration to defaults
    Reset,
}
