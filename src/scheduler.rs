//! Action execution and delayed scheduling
//!
//! Immediate actions are awaited in order. Delayed actions become one-shot
//! timer tasks owned by the [`ActionExecutor`]; each agent has its own
//! executor and cancels everything outstanding when it is removed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::action::Action;

/// The smart-home service API
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Perform `domain.service` with the given payload, blocking until done
    async fn call_service(&self, domain: &str, service: &str, data: &Value) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Timers {
    pending: Mutex<HashMap<u64, AbortHandle>>,
    firing: AtomicUsize,
    settled: Notify,
}

impl Timers {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, AbortHandle>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a timer for firing. False if it was cancelled first.
    fn claim(&self, id: u64) -> bool {
        let mut pending = self.pending();
        if pending.remove(&id).is_none() {
            return false;
        }
        self.firing.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn fired(&self) {
        self.firing.fetch_sub(1, Ordering::SeqCst);
        self.settled.notify_waiters();
    }

    fn is_idle(&self) -> bool {
        self.pending().is_empty() && self.firing.load(Ordering::SeqCst) == 0
    }
}

/// Runs parsed actions for one agent
pub struct ActionExecutor {
    control: Arc<dyn ControlPlane>,
    timers: Arc<Timers>,
    next_id: AtomicU64,
}

impl ActionExecutor {
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self {
            control,
            timers: Arc::new(Timers::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `actions` in order. Immediate ones are awaited, delayed ones are
    /// scheduled. A failing action never stops the ones after it.
    pub async fn execute_all(&self, actions: &[Action]) {
        for action in actions {
            self.execute(action).await;
        }
    }

    pub async fn execute(&self, action: &Action) {
        match action.delay() {
            Ok(Some(delay)) => self.schedule(action.clone(), delay),
            Ok(None) => call_action(self.control.as_ref(), action).await,
            Err(err) => log::warn!("Skipping action {action}: invalid delay: {err}"),
        }
    }

    fn schedule(&self, action: Action, delay: Duration) {
        log::debug!(
            "Scheduling action {} in {}",
            action,
            humantime::format_duration(delay)
        );

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let control = Arc::clone(&self.control);
        let timers = Arc::clone(&self.timers);

        // Held across spawn so the timer cannot claim its id before it is registered
        let mut pending = self.timers.pending();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !timers.claim(id) {
                return;
            }
            log::debug!("Executing delayed action {action}");
            call_action(control.as_ref(), &action).await;
            timers.fired();
        });
        pending.insert(id, task.abort_handle());
    }

    /// Number of delayed actions that have not fired yet
    pub fn pending_count(&self) -> usize {
        self.timers.pending().len()
    }

    /// Cancel every outstanding delayed action. Safe to call repeatedly.
    pub fn cancel_all(&self) {
        let cancelled: Vec<AbortHandle> = self.timers.pending().drain().map(|(_, h)| h).collect();
        if !cancelled.is_empty() {
            log::debug!("Cancelling {} scheduled action(s)", cancelled.len());
        }
        for handle in cancelled {
            handle.abort();
        }
    }

    /// Wait until no delayed action is pending or running, at most `limit`.
    /// Returns true when everything settled.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let timers = Arc::clone(&self.timers);
        let settle = async move {
            loop {
                let notified = timers.settled.notified();
                if timers.is_idle() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, settle).await.is_ok()
    }
}

async fn call_action(control: &dyn ControlPlane, action: &Action) {
    log::debug!("Executing action {action}");
    if let Err(err) = control
        .call_service(&action.domain, &action.service, &action.service_data())
        .await
    {
        log::error!(
            "Action {}.{} on {} failed: {err:#}",
            action.domain,
            action.service,
            action.target
        );
    }
}
