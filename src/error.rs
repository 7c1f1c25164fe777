//! Error types for the agent core
//!
//! Command handlers work with `anyhow`; the types here keep the distinctions
//! the agents need to react differently (reauth vs retry vs user-facing turn
//! failure).

use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to the chat-completion backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("API error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Api {
        status: Option<u16>,
        message: String,
    },

    #[error("malformed response stream: {0}")]
    Stream(String),
}

impl BackendError {
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            status: None,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        Self::Api {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/// Turn-level failure of a conversation or AI task
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Authentication error with {entry}, please reauthenticate")]
    Auth { entry: String },

    #[error("Error talking to {entry}: {error}")]
    Api { entry: String, error: String },

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Unsupported file type: {}", .0.display())]
    UnsupportedFileType(PathBuf),

    #[error("The model did not return an assistant response")]
    NoAssistantResponse,

    #[error("Error parsing structured response: {0}")]
    StructuredResponse(String),

    #[error("No final response after {0} backend round trips")]
    IterationLimit(usize),
}

/// Chat log could not be prepared for the turn
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConverseError {
    pub message: String,
}

impl ConverseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Integration could not be started
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Authentication error with {entry}: {reason}")]
    AuthFailed { entry: String, reason: String },

    #[error("{entry} is not ready: {reason}")]
    NotReady { entry: String, reason: String },
}
