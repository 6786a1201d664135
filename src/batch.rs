//! Batch coordinator: multi-file submission with a per-batch concurrency
//! cap layered on top of the global worker pool. Validates every file up
//! front, splits valid from invalid, and creates one job per valid file.

use std::path::Path;
use std::sync::Arc;

use ulid::Ulid;

use crate::engine::audio_extension_supported;
use crate::error::{OrchestratorError, Result};
use crate::job::{AudioSource, Batch, BatchAggregate, Job, JobId, JobParameters, JobStatus};
use crate::jobstore::JobStore;
use crate::worker::WorkerPool;

/// Hard cap on batch size.
pub const MAX_BATCH_FILES: usize = 10;
/// Hard cap on per-batch concurrency, independent of the global ceiling.
pub const MAX_BATCH_CONCURRENCY: u32 = 5;

/// One file's validation outcome within a batch submission.
pub enum BatchFileOutcome {
    Valid(JobId),
    Invalid { file_path: String, reason: String },
}

/// Result of [`BatchCoordinator::submit`].
pub struct BatchSubmission {
    pub batch_id: String,
    pub valid_files: usize,
    pub invalid_files: Vec<(String, String)>,
    pub job_ids: Vec<JobId>,
}

/// Accepts multi-file requests, validates each path, creates one job per
/// valid file, and schedules them under a batch-local semaphore in addition
/// to the worker pool's global ceiling.
pub struct BatchCoordinator {
    store: Arc<JobStore>,
    pool: Arc<WorkerPool>,
    max_file_size: u64,
}

impl BatchCoordinator {
    pub fn new(store: Arc<JobStore>, pool: Arc<WorkerPool>, max_file_size: u64) -> Self {
        BatchCoordinator {
            store,
            pool,
            max_file_size,
        }
    }

    /// Validate and enqueue a batch. `max_concurrent` is capped at
    /// [`MAX_BATCH_CONCURRENCY`]; the global worker ceiling still applies on
    /// top of it. A member's invalidity does not reject the batch as long as
    /// at least one file is valid.
    pub async fn submit(
        &self,
        file_paths: Vec<String>,
        parameters: JobParameters,
        max_concurrent: u32,
    ) -> Result<BatchSubmission> {
        if file_paths.is_empty() {
            return Err(OrchestratorError::invalid_parameters("file_paths must be non-empty"));
        }
        if file_paths.len() > MAX_BATCH_FILES {
            return Err(OrchestratorError::batch_too_large(format!(
                "batch of {} files exceeds the maximum of {MAX_BATCH_FILES}",
                file_paths.len()
            )));
        }

        let batch_id = Ulid::new().to_string();
        let capped_concurrent = max_concurrent.clamp(1, MAX_BATCH_CONCURRENCY);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(capped_concurrent as usize));

        let mut invalid_files = Vec::new();
        let mut job_ids = Vec::new();

        for file_path in &file_paths {
            match validate_file(file_path, self.max_file_size).await {
                Ok(()) => {
                    let mut job_params = parameters.clone();
                    job_params.max_concurrent = Some(capped_concurrent);
                    let job = Job::new_batch_member(
                        JobId::new(),
                        AudioSource {
                            path: file_path.clone(),
                            original_filename: Path::new(file_path)
                                .file_name()
                                .and_then(|n| n.to_str())
                                .unwrap_or(file_path)
                                .to_string(),
                        },
                        job_params,
                        batch_id.clone(),
                    );
                    let job_id = job.job_id.clone();
                    self.store.create(job).await?;
                    job_ids.push(job_id);
                }
                Err(reason) => invalid_files.push((file_path.clone(), reason)),
            }
        }

        if job_ids.is_empty() {
            return Err(OrchestratorError::no_valid_files("no valid audio files found in batch"));
        }

        let batch = Batch {
            batch_id: batch_id.clone(),
            member_job_ids: job_ids.clone(),
            max_concurrent: capped_concurrent,
            created_at: chrono::Utc::now(),
        };
        self.dispatch(batch, semaphore).await;

        Ok(BatchSubmission {
            batch_id,
            valid_files: job_ids.len(),
            invalid_files,
            job_ids,
        })
    }

    /// Submit each member to the worker pool, gated additionally by the
    /// batch-local semaphore so one batch can't monopolize the global pool.
    async fn dispatch(&self, batch: Batch, semaphore: Arc<tokio::sync::Semaphore>) {
        for job_id in batch.member_job_ids {
            let pool = Arc::clone(&self.pool);
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let Ok(permit) = semaphore.acquire_owned().await else {
                    return;
                };
                pool.submit(job_id).await;
                drop(permit);
            });
        }
    }

    /// Derive the aggregate status of a batch on demand from its members'
    /// current statuses; a batch has no separately persisted aggregate.
    pub async fn aggregate(&self, member_job_ids: &[JobId], batch_id: &str) -> BatchAggregate {
        let mut agg = BatchAggregate {
            batch_id: batch_id.to_string(),
            total: member_job_ids.len(),
            queued: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
        };
        for job_id in member_job_ids {
            if let Some(job) = self.store.get(job_id).await {
                match job.status {
                    JobStatus::Queued => agg.queued += 1,
                    JobStatus::Processing => agg.processing += 1,
                    JobStatus::Completed => agg.completed += 1,
                    JobStatus::Failed => agg.failed += 1,
                    JobStatus::Cancelled => agg.cancelled += 1,
                }
            }
        }
        agg
    }
}

async fn validate_file(path: &str, max_file_size: u64) -> std::result::Result<(), String> {
    let p = Path::new(path);
    if !p.exists() {
        return Err("file not found".to_string());
    }
    if !audio_extension_supported(p) {
        return Err("unsupported audio format".to_string());
    }
    let metadata = tokio::fs::metadata(p)
        .await
        .map_err(|e| format!("cannot stat file: {e}"))?;
    if metadata.len() > max_file_size {
        return Err(format!(
            "file is {} bytes, exceeding the {max_file_size} byte limit",
            metadata.len()
        ));
    }
    Ok(())
}
