//! Durable job store: one JSON file per job under a root directory, with an
//! in-memory index kept consistent with disk by funneling every mutation
//! through `update`. Held by a long-running service, so reads are served
//! from memory rather than re-reading disk on every call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::broker::ProgressBroker;
use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobId, JobStatus};

/// Bounded retry policy for [`JobStore::update`]'s write-through: a transient
/// disk failure gets three attempts with doubling backoff before the job is
/// escalated to `failed`/`server` rather than looping forever.
const WRITE_RETRY_ATTEMPTS: u32 = 3;
const WRITE_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Filter accepted by [`JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

/// Durable key -> record map from `job_id` to [`Job`].
///
/// Write-through to one JSON file per job under `<root>/<job_id>.json`.
/// Cross-id writes proceed concurrently; writes to the same id are
/// serialized by a per-id `tokio::sync::Mutex` held only around the
/// read-modify-write critical section.
pub struct JobStore {
    root: PathBuf,
    index: RwLock<HashMap<JobId, Job>>,
    locks: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
    broker: Arc<ProgressBroker>,
}

impl JobStore {
    /// Rehydrate the in-memory index from `root`, creating it if absent.
    pub async fn open(root: impl Into<PathBuf>, broker: Arc<ProgressBroker>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| OrchestratorError::server(format!("create job store root: {e}")))?;

        let mut index = HashMap::new();
        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| OrchestratorError::server(format!("read job store root: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OrchestratorError::server(format!("read dir entry: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(_) => continue,
            };
            let mut job: Job = match serde_json::from_slice(&raw) {
                Ok(j) => j,
                Err(_) => continue,
            };
            // Crash-recovery policy: jobs left `processing` across a restart
            // are marked failed/server, since no worker survived to finish them.
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Failed;
                job.error = Some(OrchestratorError::server(
                    "job was still processing when the service restarted",
                ));
                job.updated_at = chrono::Utc::now();
                let _ = write_record(&root, &job).await;
            }
            index.insert(job.job_id.clone(), job);
        }

        Ok(JobStore {
            root,
            index: RwLock::new(index),
            locks: Mutex::new(HashMap::new()),
            broker,
        })
    }

    fn record_path(&self, job_id: &JobId) -> PathBuf {
        self.root.join(format!("{job_id}.json"))
    }

    async fn lock_for(&self, job_id: &JobId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(job_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a new job record. Fails if `job_id` already exists.
    pub async fn create(&self, job: Job) -> Result<()> {
        let lock = self.lock_for(&job.job_id).await;
        let _guard = lock.lock().await;

        {
            let index = self.index.read().await;
            if index.contains_key(&job.job_id) {
                return Err(OrchestratorError::validation(format!(
                    "job already exists: {}",
                    job.job_id
                )));
            }
        }

        write_record(&self.root, &job).await?;
        let mut index = self.index.write().await;
        index.insert(job.job_id.clone(), job);
        Ok(())
    }

    /// Return the current record, if any. Lock-free snapshot read.
    pub async fn get(&self, job_id: &JobId) -> Option<Job> {
        self.index.read().await.get(job_id).cloned()
    }

    /// Atomically load-mutate-persist a job, publishing the resulting state
    /// to the broker. This is the **only** write path for job mutation, and
    /// the only call site that publishes — workers never publish directly.
    pub async fn update<F>(&self, job_id: &JobId, mutator: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let lock = self.lock_for(job_id).await;
        let _guard = lock.lock().await;

        let mut job = {
            let index = self.index.read().await;
            index
                .get(job_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::not_found(format!("job not found: {job_id}")))?
        };

        mutator(&mut job)?;

        if let Err(e) = self.write_with_retry(&job).await {
            warn!(
                job_id = %job_id,
                error = %e,
                "job record write failed after retries, escalating to failed"
            );
            job.error = Some(OrchestratorError::server(format!(
                "store write failed after {WRITE_RETRY_ATTEMPTS} attempts: {e}"
            )));
            job.status = JobStatus::Failed;
            job.progress_message = "failed: store write error".to_string();
            job.updated_at = chrono::Utc::now();
            // Best-effort: persist the escalated state, but don't retry again —
            // the in-memory index below is authoritative regardless.
            let _ = write_record(&self.root, &job).await;
        }

        {
            let mut index = self.index.write().await;
            index.insert(job_id.clone(), job.clone());
        }

        self.broker.publish(crate::job::ProgressEvent::from_job(&job));
        Ok(job)
    }

    /// Attempt `write_record` up to [`WRITE_RETRY_ATTEMPTS`] times with
    /// doubling backoff starting at [`WRITE_RETRY_BASE_DELAY`].
    async fn write_with_retry(&self, job: &Job) -> Result<()> {
        let mut delay = WRITE_RETRY_BASE_DELAY;
        let mut last_err = None;
        for attempt in 0..WRITE_RETRY_ATTEMPTS {
            match write_record(&self.root, job).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < WRITE_RETRY_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    /// List jobs, newest first, optionally filtered by status and limited.
    pub async fn list(&self, filter: JobFilter) -> Vec<Job> {
        let index = self.index.read().await;
        let mut jobs: Vec<Job> = index
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        jobs
    }

    /// Remove terminal records whose `updated_at` is older than `horizon`.
    /// Returns the number of records removed. Active jobs are never eligible.
    pub async fn delete_terminal_older_than(&self, horizon: chrono::Duration) -> Result<usize> {
        let cutoff = chrono::Utc::now() - horizon;
        let stale: Vec<JobId> = {
            let index = self.index.read().await;
            index
                .values()
                .filter(|j| j.status.is_terminal() && j.updated_at < cutoff)
                .map(|j| j.job_id.clone())
                .collect()
        };

        let mut removed = 0;
        for job_id in stale {
            let lock = self.lock_for(&job_id).await;
            let _guard = lock.lock().await;
            let path = self.record_path(&job_id);
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
            self.index.write().await.remove(&job_id);
        }
        Ok(removed)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

async fn write_record(root: &Path, job: &Job) -> Result<()> {
    let path = root.join(format!("{}.json", job.job_id));
    let contents = serde_json::to_vec_pretty(job)
        .map_err(|e| OrchestratorError::server(format!("serialize job record: {e}")))?;
    // Write-through: temp file + rename keeps a crash from truncating a
    // previously-valid record.
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &contents)
        .await
        .map_err(|e| OrchestratorError::server(format!("write job record: {e}")))?;
    tokio::fs::rename(&tmp_path, &path)
        .await
        .map_err(|e| OrchestratorError::server(format!("commit job record: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AudioSource, JobParameters};

    fn sample_job() -> Job {
        Job::new_single(
            JobId::new(),
            AudioSource {
                path: "clip.wav".into(),
                original_filename: "clip.wav".into(),
            },
            JobParameters::default(),
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ProgressBroker::new());
        let store = JobStore::open(dir.path(), broker).await.unwrap();
        let job = sample_job();
        let id = job.job_id.clone();
        store.create(job.clone()).await.unwrap();
        let loaded = store.get(&id).await.unwrap();
        assert_eq!(loaded.job_id, id);
        assert_eq!(loaded.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn create_duplicate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ProgressBroker::new());
        let store = JobStore::open(dir.path(), broker).await.unwrap();
        let job = sample_job();
        store.create(job.clone()).await.unwrap();
        let err = store.create(job).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn update_missing_job_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ProgressBroker::new());
        let store = JobStore::open(dir.path(), broker).await.unwrap();
        let err = store
            .update(&JobId::new(), |_| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn update_rejects_illegal_transition() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ProgressBroker::new());
        let store = JobStore::open(dir.path(), broker).await.unwrap();
        let job = sample_job();
        let id = job.job_id.clone();
        store.create(job).await.unwrap();
        let err = store
            .update(&id, |j| j.transition(JobStatus::Completed))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Server);
    }

    #[tokio::test]
    async fn persist_then_rehydrate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ProgressBroker::new());
        let store = JobStore::open(dir.path(), broker.clone()).await.unwrap();
        let job = sample_job();
        let id = job.job_id.clone();
        store.create(job).await.unwrap();

        let store2 = JobStore::open(dir.path(), broker).await.unwrap();
        let loaded = store2.get(&id).await.unwrap();
        assert_eq!(loaded.job_id, id);
    }

    #[tokio::test]
    async fn rehydrate_marks_processing_jobs_failed() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ProgressBroker::new());
        let store = JobStore::open(dir.path(), broker.clone()).await.unwrap();
        let mut job = sample_job();
        let id = job.job_id.clone();
        job.status = JobStatus::Processing;
        store.create(job).await.unwrap();

        let store2 = JobStore::open(dir.path(), broker).await.unwrap();
        let loaded = store2.get(&id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error.unwrap().kind, crate::error::ErrorKind::Server);
    }

    #[tokio::test]
    async fn update_escalates_to_failed_after_persistent_write_failures() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("jobs");
        let broker = Arc::new(ProgressBroker::new());
        let store = JobStore::open(&root, broker).await.unwrap();
        let job = sample_job();
        let id = job.job_id.clone();
        store.create(job).await.unwrap();

        // Replace the store root with a regular file so every write under it fails.
        tokio::fs::remove_dir_all(&root).await.unwrap();
        tokio::fs::write(&root, b"not a directory").await.unwrap();

        let result = store
            .update(&id, |j| j.transition(JobStatus::Processing))
            .await
            .unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error.unwrap().kind, crate::error::ErrorKind::Server);
    }

    #[tokio::test]
    async fn retention_sweep_only_removes_old_terminal_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ProgressBroker::new());
        let store = JobStore::open(dir.path(), broker).await.unwrap();

        let mut old_done = sample_job();
        old_done.status = JobStatus::Completed;
        old_done.updated_at = chrono::Utc::now() - chrono::Duration::hours(72);
        let old_id = old_done.job_id.clone();

        let mut fresh_done = sample_job();
        fresh_done.status = JobStatus::Completed;
        let fresh_id = fresh_done.job_id.clone();

        let active = sample_job();
        let active_id = active.job_id.clone();

        store.create(old_done).await.unwrap();
        store.create(fresh_done).await.unwrap();
        store.create(active).await.unwrap();

        let removed = store
            .delete_terminal_older_than(chrono::Duration::hours(48))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&old_id).await.is_none());
        assert!(store.get(&fresh_id).await.is_some());
        assert!(store.get(&active_id).await.is_some());
    }
}
