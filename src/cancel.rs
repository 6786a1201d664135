//! Cancellation registry: a per-job cooperative cancel flag plus a map from
//! in-flight job ids to their token. Built from an `AtomicBool` and a
//! `tokio::sync::Notify` rather than `tokio_util::sync::CancellationToken`,
//! since `tokio-util` isn't otherwise needed here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::job::JobId;

/// A single job's cancel signal. Cheaply cloneable; all clones observe the
/// same underlying flag.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    fn new() -> Self {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn fire(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Construct a standalone token for use in engine-adapter tests that
    /// don't need a full [`CancellationRegistry`].
    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self::new()
    }

    #[cfg(test)]
    pub fn fire_for_test(&self) {
        self.fire();
    }

    /// Resolves once the token is cancelled. Intended for use in
    /// `tokio::select!` alongside subprocess waits so cancellation
    /// interrupts a suspended worker rather than waiting for the next
    /// cooperative checkpoint.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

/// Outcome of a [`CancellationRegistry::cancel`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotCancellable,
}

/// Maps in-flight job ids to their cancellation token. Entries are added at
/// claim time by the worker pool and removed once the worker returns, whether
/// the job completed, failed, or was cancelled.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<JobId, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        CancellationRegistry {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fresh token for a job a worker is about to claim.
    pub async fn register(&self, job_id: JobId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().await.insert(job_id, token.clone());
        token
    }

    /// Flip the token for `job_id`, if one is registered. Returns
    /// `NotCancellable` if the job isn't currently in flight (either never
    /// submitted, or already terminal and unregistered) — cancelling an
    /// already-cancelled job is idempotent and still reports `Cancelled`.
    pub async fn cancel(&self, job_id: &JobId) -> CancelOutcome {
        let tokens = self.tokens.lock().await;
        match tokens.get(job_id) {
            Some(token) => {
                token.fire();
                CancelOutcome::Cancelled
            }
            None => CancelOutcome::NotCancellable,
        }
    }

    /// Drop the token once the worker has returned.
    pub async fn unregister(&self, job_id: &JobId) {
        self.tokens.lock().await.remove(job_id);
    }

    pub async fn is_registered(&self, job_id: &JobId) -> bool {
        self.tokens.lock().await.contains_key(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_unregistered_job_is_not_cancellable() {
        let registry = CancellationRegistry::new();
        let outcome = registry.cancel(&JobId::new()).await;
        assert_eq!(outcome, CancelOutcome::NotCancellable);
    }

    #[tokio::test]
    async fn cancel_registered_job_flips_token() {
        let registry = CancellationRegistry::new();
        let job_id = JobId::new();
        let token = registry.register(job_id.clone()).await;
        assert!(!token.is_cancelled());

        let outcome = registry.cancel(&job_id).await;
        assert_eq!(outcome, CancelOutcome::Cancelled);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let registry = CancellationRegistry::new();
        let job_id = JobId::new();
        registry.register(job_id.clone()).await;
        assert_eq!(registry.cancel(&job_id).await, CancelOutcome::Cancelled);
        assert_eq!(registry.cancel(&job_id).await, CancelOutcome::Cancelled);
    }

    #[tokio::test]
    async fn unregister_removes_token() {
        let registry = CancellationRegistry::new();
        let job_id = JobId::new();
        registry.register(job_id.clone()).await;
        registry.unregister(&job_id).await;
        assert!(!registry.is_registered(&job_id).await);
        assert_eq!(registry.cancel(&job_id).await, CancelOutcome::NotCancellable);
    }

    #[tokio::test]
    async fn cancelled_future_resolves_after_fire() {
        let registry = CancellationRegistry::new();
        let job_id = JobId::new();
        let token = registry.register(job_id.clone()).await;
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        registry.cancel(&job_id).await;
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("cancellation future should resolve promptly")
            .unwrap();
    }
}
