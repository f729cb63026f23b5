use super::codec::AmiResponse;
use super::error::{AmiError, AmiResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

pub type ActionReceiver = oneshot::Receiver<AmiResult<AmiResponse>>;

struct PendingAction {
    action: String,
    issued_at: Instant,
    timeout: Duration,
    sender: oneshot::Sender<AmiResult<AmiResponse>>,
    timer: AbortHandle,
}

/// Table of actions awaiting a response, keyed by correlation id.
/// Every entry leaves the table exactly once: through `resolve` when the
/// response arrives or through its timer.
pub struct ActionCorrelator {
    pending: Mutex<HashMap<String, PendingAction>>,
}

pub type ActionCorrelatorRef = Arc<ActionCorrelator>;

impl ActionCorrelator {
    pub fn new() -> ActionCorrelatorRef {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(
        self: &Arc<Self>,
        action_id: &str,
        action: &str,
        timeout: Duration,
    ) -> ActionReceiver {
        let (sender, receiver) = oneshot::channel();
        let weak = Arc::downgrade(self);
        let id = action_id.to_string();

        let mut pending = self.pending.lock().unwrap();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(correlator) = weak.upgrade() {
                correlator.expire(&id);
            }
        })
        .abort_handle();

        if let Some(previous) = pending.insert(
            action_id.to_string(),
            PendingAction {
                action: action.to_string(),
                issued_at: Instant::now(),
                timeout,
                sender,
                timer,
            },
        ) {
            // ids are unique per process, a collision means a caller reused one
            warn!(action_id, action = %previous.action, "replacing pending action with same id");
            previous.timer.abort();
        }
        receiver
    }

    /// Settle the pending action matching the response's id. Returns false
    /// when nothing is waiting for it (late response or unsolicited).
    pub fn resolve(&self, response: AmiResponse) -> bool {
        let Some(action_id) = response.action_id() else {
            return false;
        };
        let Some(entry) = self.pending.lock().unwrap().remove(action_id) else {
            debug!(action_id, "response without pending action");
            return false;
        };
        entry.timer.abort();

        debug!(
            action_id,
            action = %entry.action,
            elapsed = entry.issued_at.elapsed().as_millis(),
            success = response.is_success(),
            "action settled"
        );

        let result = if response.is_success() {
            Ok(response)
        } else {
            Err(AmiError::ActionRejected {
                action: entry.action,
                message: response
                    .message()
                    .unwrap_or_else(|| response.outcome())
                    .to_string(),
            })
        };
        entry.sender.send(result).ok();
        true
    }

    fn expire(&self, action_id: &str) -> bool {
        let Some(entry) = self.pending.lock().unwrap().remove(action_id) else {
            return false;
        };
        warn!(action_id, action = %entry.action, "action timed out");
        entry
            .sender
            .send(Err(AmiError::ActionTimeout {
                action: entry.action,
                timeout: entry.timeout,
            }))
            .ok();
        true
    }

    /// Drop an entry whose action never reached the wire.
    pub fn discard(&self, action_id: &str) -> bool {
        match self.pending.lock().unwrap().remove(action_id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_pending(&self, action_id: &str) -> bool {
        self.pending.lock().unwrap().contains_key(action_id)
    }
}

/// Wait for the outcome of a registered action.
pub async fn wait_for(receiver: ActionReceiver) -> AmiResult<AmiResponse> {
    receiver
        .await
        .unwrap_or_else(|_| Err(AmiError::connection("action correlator dropped")))
}
