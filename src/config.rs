//! Configuration management for pplx-assist
//!
//! Supports:
//! - TOML config file at XDG locations
//! - Environment variable overrides
//! - Command-line argument overrides

use std::env;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use env_logger::fmt::WriteStyle;
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::agent::{IterationLimitPolicy, LoopPolicy, MAX_TOOL_ITERATIONS};
use crate::backend::{DEFAULT_BASE_URL, RECOMMENDED_CHAT_MODEL};
use crate::cli::{GlobalOpts, OutputFormat};
use crate::prompt::HomeLocation;
use crate::setup::RetrySchedule;

const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Runtime context containing resolved configuration
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub global: GlobalOpts,
    pub config: AppConfig,
    config_path: PathBuf,
}

impl RuntimeContext {
    pub fn new(global: &GlobalOpts) -> Result<Self> {
        let config_path = resolve_config_path(global.config.as_ref())?;
        let config = load_config(&config_path, global)?;

        Ok(Self {
            global: global.clone(),
            config,
            config_path,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn init_logging(&self) -> Result<()> {
        if self.global.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(&self.config.logging.level),
        );

        if let Some(level) = self.cli_log_level() {
            builder.filter_level(level);
        }

        let force_color = env::var_os("FORCE_COLOR").is_some();
        let disable_color = self.global.no_color
            || env::var_os("NO_COLOR").is_some()
            || (!force_color && !std::io::stderr().is_terminal());

        if disable_color {
            builder.write_style(WriteStyle::Never);
        } else if force_color {
            builder.write_style(WriteStyle::Always);
        } else {
            builder.write_style(WriteStyle::Auto);
        }

        builder.try_init().or_else(|err| {
            if self.global.verbose > 0 {
                eprintln!("logger already initialized: {err}");
            }
            Ok(())
        })
    }

    fn cli_log_level(&self) -> Option<LevelFilter> {
        if self.global.trace {
            Some(LevelFilter::Trace)
        } else if self.global.debug {
            Some(LevelFilter::Debug)
        } else {
            match self.global.verbose {
                0 => None,
                1 => Some(LevelFilter::Info),
                2 => Some(LevelFilter::Debug),
                _ => Some(LevelFilter::Trace),
            }
        }
    }

    /// Get the effective Perplexity API key
    pub fn api_key(&self) -> Result<&str> {
        self.global
            .api_key
            .as_deref()
            .or(self.config.perplexity.api_key.as_deref())
            .ok_or_else(|| {
                anyhow!(
                    "No Perplexity API key configured.\n\
                    Set via --api-key, PERPLEXITY_API_KEY env var, or in config file."
                )
            })
    }

    /// Get the Perplexity request timeout
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.config.perplexity.timeout)
    }

    /// Get the effective server URL
    pub fn server_url(&self) -> Result<&str> {
        self.global
            .server
            .as_deref()
            .or(self.config.homeassistant.server.as_deref())
            .ok_or_else(|| {
                anyhow!(
                    "No Home Assistant server configured.\n\
                    Set via --server, HASS_SERVER env var, or in config file."
                )
            })
    }

    /// Get the effective auth token
    pub fn token(&self) -> Result<&str> {
        self.global
            .token
            .as_deref()
            .or(self.config.homeassistant.token.as_deref())
            .ok_or_else(|| {
                anyhow!(
                    "No authentication token configured.\n\
                    Set via --token, HASS_TOKEN env var, or in config file."
                )
            })
    }

    /// Get the effective Home Assistant timeout in seconds
    pub fn timeout(&self) -> u64 {
        self.global
            .timeout
            .unwrap_or(self.config.homeassistant.timeout)
    }

    /// Check if SSL verification should be skipped
    pub fn insecure(&self) -> bool {
        self.global.insecure || self.config.homeassistant.insecure
    }

    /// Get the effective output format
    pub fn output_format(&self) -> OutputFormat {
        if self.global.json {
            return OutputFormat::Json;
        }
        self.global
            .output_format
            .unwrap_or(match self.config.output.format.as_str() {
                "json" => OutputFormat::Json,
                "yaml" => OutputFormat::Yaml,
                "table" => OutputFormat::Table,
                _ => OutputFormat::Auto,
            })
    }

    pub fn retry_schedule(&self) -> RetrySchedule {
        RetrySchedule {
            retries: self.config.setup.retries,
            delay: Duration::from_secs(self.config.setup.retry_delay),
        }
    }

    pub fn loop_policy(&self) -> LoopPolicy {
        LoopPolicy {
            max_iterations: self.config.conversation.max_iterations.max(1),
            on_exhausted: self.config.conversation.iteration_limit,
        }
    }
}

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub perplexity: PerplexityConfig,
    pub homeassistant: HomeAssistantConfig,
    pub setup: SetupConfig,
    pub conversation: ConversationConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
    pub agents: Vec<AgentConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            perplexity: PerplexityConfig::default(),
            homeassistant: HomeAssistantConfig::default(),
            setup: SetupConfig::default(),
            conversation: ConversationConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
            agents: vec![
                AgentConfig {
                    name: "Sonar".to_string(),
                    kind: AgentKind::Conversation,
                    llm_hass_api: vec!["assist".to_string()],
                    ..Default::default()
                },
                AgentConfig {
                    name: "Sonar AI Task".to_string(),
                    kind: AgentKind::AiTaskData,
                    ..Default::default()
                },
            ],
        }
    }
}

/// The config entry: credential and connection to Perplexity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerplexityConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout: u64,
}

impl Default for PerplexityConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeAssistantConfig {
    pub server: Option<String>,
    pub token: Option<String>,
    pub timeout: u64,
    pub insecure: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub country: Option<String>,
}

impl HomeAssistantConfig {
    /// Location overrides, each used only when the server reports nothing
    pub fn location_overrides(&self) -> HomeLocation {
        HomeLocation {
            latitude: self.latitude,
            longitude: self.longitude,
            country: self.country.clone(),
        }
    }
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            server: None,
            token: None,
            timeout: 30,
            insecure: false,
            latitude: None,
            longitude: None,
            country: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    pub retries: u32,
    pub retry_delay: u64,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub max_entities: usize,
    pub iteration_limit: IterationLimitPolicy,
    pub max_iterations: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_entities: 200,
            iteration_limit: IterationLimitPolicy::Stop,
            max_iterations: MAX_TOOL_ITERATIONS,
        }
    }
}

/// Which entity a subentry creates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    Conversation,
    AiTaskData,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Conversation => "conversation",
            AgentKind::AiTaskData => "ai_task_data",
        }
    }
}

/// A subentry: one conversation agent or AI task entity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub kind: AgentKind,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub llm_hass_api: Vec<String>,
    pub web_search: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    pub include_home_location: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: AgentKind::Conversation,
            model: RECOMMENDED_CHAT_MODEL.to_string(),
            prompt: None,
            llm_hass_api: Vec::new(),
            web_search: false,
            reasoning_effort: None,
            include_home_location: false,
        }
    }
}

impl AgentConfig {
    /// Entity id derived from the kind and name, e.g. `conversation.sonar`
    pub fn entity_id(&self) -> String {
        let domain = match self.kind {
            AgentKind::Conversation => "conversation",
            AgentKind::AiTaskData => "ai_task",
        };
        let slug: String = self
            .name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let slug = slug
            .split('_')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        format!("{domain}.{slug}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: String,
    pub no_headers: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "auto".to_string(),
            no_headers: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        let expanded = expand_path(path)?;
        if expanded.is_dir() {
            return Ok(expanded.join("config.toml"));
        }
        return Ok(expanded);
    }

    Ok(default_config_dir()?.join("config.toml"))
}

fn load_config(config_path: &Path, global: &GlobalOpts) -> Result<AppConfig> {
    if !config_path.exists() {
        write_default_config(config_path)?;
    }

    let mut app_config = read_config(config_path)?;

    if global.no_headers {
        app_config.output.no_headers = true;
    }

    Ok(app_config)
}

fn read_config(config_path: &Path) -> Result<AppConfig> {
    let config = Config::builder()
        .set_default("perplexity.base_url", DEFAULT_BASE_URL)?
        .set_default("perplexity.timeout", 60_i64)?
        .set_default("homeassistant.timeout", 30_i64)?
        .set_default("homeassistant.insecure", false)?
        .set_default("setup.retries", 3_i64)?
        .set_default("setup.retry_delay", 5_i64)?
        .set_default("conversation.max_entities", 200_i64)?
        .set_default("conversation.iteration_limit", "stop")?
        .set_default("conversation.max_iterations", MAX_TOOL_ITERATIONS as i64)?
        .set_default("output.format", "auto")?
        .set_default("output.no_headers", false)?
        .set_default("logging.level", "warn")?
        .add_source(
            File::from(config_path)
                .format(FileFormat::Toml)
                .required(false),
        )
        // PPLX__SECTION__KEY; flat PERPLEXITY_* and HASS_* are mapped below
        .add_source(
            Environment::with_prefix("PPLX")
                .try_parsing(true)
                .separator("__"),
        )
        .build()?;

    let mut app_config: AppConfig = config
        .try_deserialize()
        .with_context(|| format!("reading config {}", config_path.display()))?;

    apply_prefixed_env(&mut app_config);
    Ok(app_config)
}

/// Map the flat `PERPLEXITY_*` and `HASS_*` variables onto their sections
fn apply_prefixed_env(app_config: &mut AppConfig) {
    let var = |name: &str| env::var(name).ok().filter(|v| !v.is_empty());

    if let Some(key) = var("PERPLEXITY_API_KEY") {
        app_config.perplexity.api_key = Some(key);
    }
    if let Some(url) = var("PERPLEXITY_BASE_URL") {
        app_config.perplexity.base_url = url;
    }
    if let Some(server) = var("HASS_SERVER") {
        app_config.homeassistant.server = Some(server);
    }
    if let Some(token) = var("HASS_TOKEN") {
        app_config.homeassistant.token = Some(token);
    }
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config")?;

    let content = format!(
        "# pplx-assist configuration\n\
        # File: {}\n\
        #\n\
        # Environment variables:\n\
        #   PERPLEXITY_API_KEY - Perplexity API key\n\
        #   HASS_SERVER        - Home Assistant server URL\n\
        #   HASS_TOKEN         - Home Assistant access token\n\
        #   PPLX__*            - Override any config value (e.g., PPLX__LOGGING__LEVEL=debug)\n\
        \n\
        {toml}",
        path.display()
    );

    fs::write(path, content).with_context(|| format!("writing config to {}", path.display()))
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        let expanded = shellexpand::full(text).context("expanding path")?;
        Ok(PathBuf::from(expanded.to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}
