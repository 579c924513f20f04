//! Tool calls waiting on the user.
//!
//! Some tools cannot finish until the user does something (take a photo of the
//! crop). Each such call parks a oneshot sender here under its call id; the host
//! application answers it with [`PendingRequests::complete`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<String>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Park a request. A second registration for the same id replaces (and
    /// thereby cancels) the first.
    pub fn register(&self, call_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        if self.lock().insert(call_id.to_string(), tx).is_some() {
            debug!(call_id, "Replaced an existing pending request");
        }
        rx
    }

    /// Deliver the user's answer. Returns false if nothing was waiting.
    pub fn complete(&self, call_id: &str, value: String) -> bool {
        match self.lock().remove(call_id) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Abandon a request; the waiting tool sees a cancellation.
    pub fn cancel(&self, call_id: &str) -> bool {
        self.lock().remove(call_id).is_some()
    }

    pub fn is_pending(&self, call_id: &str) -> bool {
        self.lock().contains_key(call_id)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
