//! Integration setup
//!
//! Builds the shared backend client once, validates the credential with a
//! one-token completion, and hands the resulting [`EntryRuntime`] to every
//! agent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{ChatBackend, ChatMessage, ChatRequest, RECOMMENDED_CHAT_MODEL};
use crate::error::{BackendError, SetupError};

/// Runtime data of a set-up config entry, shared by its agents
pub struct EntryRuntime {
    title: String,
    backend: Arc<dyn ChatBackend>,
    reauth_requested: AtomicBool,
}

impl EntryRuntime {
    pub fn new(title: impl Into<String>, backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            title: title.into(),
            backend,
            reauth_requested: AtomicBool::new(false),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn backend(&self) -> &dyn ChatBackend {
        self.backend.as_ref()
    }

    /// Flag the entry as needing a new credential
    pub fn request_reauth(&self) {
        self.reauth_requested.store(true, Ordering::SeqCst);
    }

    pub fn reauth_requested(&self) -> bool {
        self.reauth_requested.load(Ordering::SeqCst)
    }
}

/// Outcome of validating a credential, named like config-flow errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Ok,
    InvalidAuth,
    CannotConnect,
}

impl ValidationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationResult::Ok => "ok",
            ValidationResult::InvalidAuth => "invalid_auth",
            ValidationResult::CannotConnect => "cannot_connect",
        }
    }
}

fn probe_request() -> ChatRequest {
    ChatRequest {
        model: RECOMMENDED_CHAT_MODEL.to_string(),
        messages: vec![ChatMessage::text("user", "hi")],
        disable_search: Some(true),
        max_tokens: Some(1),
        ..Default::default()
    }
}

/// Check that the backend accepts the credential
pub async fn validate(backend: &dyn ChatBackend) -> Result<(), BackendError> {
    backend.complete(&probe_request()).await.map(|_| ())
}

pub async fn validate_input(backend: &dyn ChatBackend) -> ValidationResult {
    match validate(backend).await {
        Ok(()) => ValidationResult::Ok,
        Err(BackendError::Authentication(reason)) => {
            log::debug!("Credential rejected: {reason}");
            ValidationResult::InvalidAuth
        }
        Err(err) => {
            log::debug!("Cannot connect: {err}");
            ValidationResult::CannotConnect
        }
    }
}

/// Retry schedule for entries that are not ready yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub retries: u32,
    pub delay: Duration,
}

/// Set up the entry once
pub async fn setup_entry(
    title: &str,
    backend: Arc<dyn ChatBackend>,
) -> Result<Arc<EntryRuntime>, SetupError> {
    match validate(backend.as_ref()).await {
        Ok(()) => Ok(Arc::new(EntryRuntime::new(title, backend))),
        Err(BackendError::Authentication(reason)) => Err(SetupError::AuthFailed {
            entry: title.to_string(),
            reason,
        }),
        Err(err) => Err(SetupError::NotReady {
            entry: title.to_string(),
            reason: err.to_string(),
        }),
    }
}

/// Set up the entry, retrying while it is not ready. Auth failures are final.
pub async fn setup_entry_with_retry(
    title: &str,
    backend: Arc<dyn ChatBackend>,
    schedule: RetrySchedule,
) -> Result<Arc<EntryRuntime>, SetupError> {
    let mut attempt = 0;
    loop {
        match setup_entry(title, Arc::clone(&backend)).await {
            Err(SetupError::NotReady { reason, .. }) if attempt < schedule.retries => {
                attempt += 1;
                log::warn!(
                    "{title} not ready ({reason}), retrying in {} (attempt {attempt}/{})",
                    humantime::format_duration(schedule.delay),
                    schedule.retries
                );
                tokio::time::sleep(schedule.delay).await;
            }
            result => return result,
        }
    }
}
