use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cloneable flag used to request cancellation of the running workflow.
///
/// The orchestrator polls the token between steps and between transfer chunks, and waits on it
/// while a device call or a download is in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Completes once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent `cancel` is not missed
            let notified = self.shared.notify.notified();

            if self.is_cancelled() {
                return;
            }

            notified.await;
        }
    }

    /// Clears a previous request. Called when a new run starts.
    pub fn reset(&self) {
        self.shared.cancelled.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_share_cancellation_between_clones() {
        let token = CancelToken::new();
        let handle = token.clone();

        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());

        token.reset();
        assert!(!handle.is_cancelled());
    }

    #[tokio::test]
    async fn it_should_wake_waiters_on_cancel() {
        let token = CancelToken::new();
        let handle = token.clone();

        let ((), ()) = tokio::join!(token.cancelled(), async {
            tokio::task::yield_now().await;
            handle.cancel();
        });

        assert!(token.is_cancelled());

        // Already cancelled tokens complete at once
        token.cancelled().await;
    }
}
