//! Run cancellation.
//!
//! A [`CancelHandle`] is a flag plus a [`Notify`]: the walker checks the flag
//! at every checkpoint and races in-flight node tasks against the notify.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::info;

/// Cancellation signal for one run.
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call more than once.
    pub fn cancel(&self) {
        let was_cancelled = self.cancelled.swap(true, Ordering::SeqCst);
        if !was_cancelled {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested (immediately if it already was).
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Registry of cancel handles for the runs currently in flight.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    handles: Arc<tokio::sync::Mutex<HashMap<String, CancelHandle>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and return its handle.
    pub async fn register(&self, run_id: &str) -> CancelHandle {
        let handle = CancelHandle::new();
        self.handles
            .lock()
            .await
            .insert(run_id.to_string(), handle.clone());
        handle
    }

    /// Request cancellation of a run. Returns false if the run is not registered.
    pub async fn cancel(&self, run_id: &str) -> bool {
        if let Some(handle) = self.handles.lock().await.get(run_id) {
            info!("Cancellation requested for run {}", run_id);
            handle.cancel();
            true
        } else {
            false
        }
    }

    /// Cancel every registered run; returns how many were signalled.
    pub async fn cancel_all(&self) -> usize {
        let handles = self.handles.lock().await;
        for handle in handles.values() {
            handle.cancel();
        }
        handles.len()
    }

    /// Unregister a run (called when it stops).
    pub async fn unregister(&self, run_id: &str) {
        self.handles.lock().await.remove(run_id);
    }

    /// Ids of registered runs, sorted.
    pub async fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let handle = CancelHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.cancelled().await })
        };
        tokio::task::yield_now().await;
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let handle = CancelHandle::new();
        handle.cancel();
        handle.cancel();
        tokio::time::timeout(Duration::from_millis(100), handle.cancelled())
            .await
            .expect("already cancelled");
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let registry = CancelRegistry::new();
        let handle = registry.register("run-1").await;
        registry.register("run-2").await;
        assert_eq!(registry.active_runs().await, vec!["run-1", "run-2"]);

        assert!(registry.cancel("run-1").await);
        assert!(handle.is_cancelled());
        assert!(!registry.cancel("missing").await);

        registry.unregister("run-1").await;
        assert_eq!(registry.cancel_all().await, 1);
    }
}
