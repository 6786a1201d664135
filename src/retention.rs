//! Retention sweeper: periodically deletes terminal job records and their
//! artifacts past a configured horizon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::broker::ProgressBroker;
use crate::jobstore::JobStore;

/// Spawns a background sweep loop at [`Service`](crate::service::Service)
/// startup; holds no state of its own beyond the store and broker handles.
pub struct RetentionSweeper {
    store: Arc<JobStore>,
    broker: Arc<ProgressBroker>,
    artifacts_root: PathBuf,
    horizon: chrono::Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<JobStore>,
        broker: Arc<ProgressBroker>,
        artifacts_root: impl Into<PathBuf>,
        horizon: chrono::Duration,
        interval: Duration,
    ) -> Self {
        RetentionSweeper {
            store,
            broker,
            artifacts_root: artifacts_root.into(),
            horizon,
            interval,
        }
    }

    /// Run one sweep pass: delete expired terminal records, remove the
    /// artifact directory for each, and forget the broker's cached channel.
    /// Exposed separately from [`Self::spawn`] so tests can drive a single
    /// pass deterministically.
    pub async fn sweep_once(&self) -> usize {
        let job_ids_before = self.store.list(Default::default()).await;
        let removed = match self.store.delete_terminal_older_than(self.horizon).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "retention sweep failed");
                return 0;
            }
        };

        if removed > 0 {
            let remaining: std::collections::HashSet<_> = self
                .store
                .list(Default::default())
                .await
                .into_iter()
                .map(|j| j.job_id)
                .collect();
            for job in job_ids_before {
                if !remaining.contains(&job.job_id) {
                    self.broker.forget(&job.job_id);
                    let dir = self.artifacts_root.join(job.job_id.as_str());
                    let _ = tokio::fs::remove_dir_all(dir).await;
                }
            }
            info!(removed, "retention sweep removed expired job records");
        }
        removed
    }

    /// Spawn the periodic sweep loop. The returned handle may be aborted on
    /// shutdown.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AudioSource, Job, JobParameters, JobStatus};

    #[tokio::test]
    async fn sweep_removes_expired_terminal_jobs_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ProgressBroker::new());
        let store = Arc::new(JobStore::open(dir.path().join("jobs"), broker.clone()).await.unwrap());
        let artifacts_root = dir.path().join("artifacts");

        let mut job = Job::new_single(
            crate::job::JobId::new(),
            AudioSource {
                path: "a.wav".into(),
                original_filename: "a.wav".into(),
            },
            JobParameters::default(),
        );
        job.status = JobStatus::Completed;
        job.updated_at = chrono::Utc::now() - chrono::Duration::hours(72);
        let job_id = job.job_id.clone();
        store.create(job).await.unwrap();

        let artifact_dir = artifacts_root.join(job_id.as_str());
        tokio::fs::create_dir_all(&artifact_dir).await.unwrap();
        tokio::fs::write(artifact_dir.join("result.json"), b"{}").await.unwrap();

        let sweeper = RetentionSweeper::new(
            Arc::clone(&store),
            broker,
            artifacts_root.clone(),
            chrono::Duration::hours(48),
            Duration::from_secs(3600),
        );
        let removed = sweeper.sweep_once().await;
        assert_eq!(removed, 1);
        assert!(store.get(&job_id).await.is_none());
        assert!(!artifact_dir.exists());
    }

    #[tokio::test]
    async fn sweep_never_removes_active_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ProgressBroker::new());
        let store = Arc::new(JobStore::open(dir.path().join("jobs"), broker.clone()).await.unwrap());

        let mut job = Job::new_single(
            crate::job::JobId::new(),
            AudioSource {
                path: "a.wav".into(),
                original_filename: "a.wav".into(),
            },
            JobParameters::default(),
        );
        job.updated_at = chrono::Utc::now() - chrono::Duration::hours(72);
        let job_id = job.job_id.clone();
        store.create(job).await.unwrap();

        let sweeper = RetentionSweeper::new(
            store.clone(),
            broker,
            dir.path().join("artifacts"),
            chrono::Duration::hours(48),
            Duration::from_secs(3600),
        );
        sweeper.sweep_once().await;
        assert!(store.get(&job_id).await.is_some());
    }
}
