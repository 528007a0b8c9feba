//! A cancellation token that carries the reason it was tripped.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Clonable cancellation handle shared between the engine and handler or
/// caller code.
///
/// Wraps a [`CancellationToken`] and remembers the first reason passed to
/// [`cancel`](Self::cancel), so the engine can forward it to the peer in a
/// `notifications/cancelled` payload or into the caller's error.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the handle. Only the first call records its reason; later
    /// calls are no-ops.
    pub fn cancel(&self, reason: Option<String>) {
        if !self.token.is_cancelled() {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = reason;
            }
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason recorded when the handle was tripped, if any.
    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Completes when the handle is tripped.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
