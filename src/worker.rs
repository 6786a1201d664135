//! Worker pool: drives a job from `queued` to a terminal state under a
//! process-wide concurrency ceiling. A single dispatcher task reads queued
//! jobs from the store in `created_at` order and claims a semaphore permit
//! for each in that order, so concurrent submissions are served FIFO rather
//! than racing each other for a permit.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::broker::ProgressBroker;
use crate::cancel::CancellationRegistry;
use crate::engine::{is_diarization_unavailable, DiarizationEngine, ProgressSink, TranscriptionEngine};
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::job::{ArtifactMetadata, JobId, JobParameters, JobStatus, TranscriptionArtifact};
use crate::jobstore::{JobFilter, JobStore};
use crate::merge::merge_segments;

/// Bridges engine-adapter progress checkpoints back into the job store,
/// which is the sole publisher to the broker.
struct StoreProgressSink {
    store: Arc<JobStore>,
    job_id: JobId,
    stage_message: &'static str,
}

#[async_trait::async_trait]
impl ProgressSink for StoreProgressSink {
    async fn report(&self, progress: u8, message: &str) {
        let message = if message.is_empty() {
            self.stage_message.to_string()
        } else {
            message.to_string()
        };
        if let Err(e) = self
            .store
            .update(&self.job_id, move |job| {
                job.set_progress(progress, message.clone());
                Ok(())
            })
            .await
        {
            warn!(job_id = %self.job_id, error = %e, "failed to persist progress tick");
        }
    }
}

/// Bounded pool of job executions.
pub struct WorkerPool {
    store: Arc<JobStore>,
    broker: Arc<ProgressBroker>,
    cancellation: Arc<CancellationRegistry>,
    transcription: Arc<dyn TranscriptionEngine>,
    diarization: Arc<dyn DiarizationEngine>,
    semaphore: Arc<tokio::sync::Semaphore>,
    artifacts_root: std::path::PathBuf,
    /// Wakes the dispatcher when a new job is queued or a permit frees up.
    dispatch_signal: tokio::sync::Notify,
}

impl WorkerPool {
    pub fn new(
        store: Arc<JobStore>,
        broker: Arc<ProgressBroker>,
        cancellation: Arc<CancellationRegistry>,
        transcription: Arc<dyn TranscriptionEngine>,
        diarization: Arc<dyn DiarizationEngine>,
        concurrency: usize,
        artifacts_root: impl Into<std::path::PathBuf>,
    ) -> Self {
        WorkerPool {
            store,
            broker,
            cancellation,
            transcription,
            diarization,
            semaphore: Arc::new(tokio::sync::Semaphore::new(concurrency.max(1))),
            artifacts_root: artifacts_root.into(),
            dispatch_signal: tokio::sync::Notify::new(),
        }
    }

    /// Mark `job_id` ready for dispatch. The actual semaphore acquisition and
    /// execution happens in the dispatcher loop spawned by
    /// [`Self::spawn_dispatcher`], which re-reads the store rather than
    /// trusting this call's ordering, so this is a cheap wakeup rather than
    /// the scheduling decision itself.
    pub async fn submit(&self, job_id: JobId) {
        info!(job_id = %job_id, "job queued for dispatch");
        self.dispatch_signal.notify_one();
    }

    /// Spawn the single dispatcher task. Must be called once per pool
    /// (`Service::start` does this at construction); every `submit` and every
    /// permit release afterward only wakes this loop, which is solely
    /// responsible for deciding what runs next.
    pub fn spawn_dispatcher(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut dispatched: HashSet<JobId> = HashSet::new();
            loop {
                let mut queued = self
                    .store
                    .list(JobFilter {
                        status: Some(JobStatus::Queued),
                        limit: None,
                    })
                    .await;
                queued.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                let still_queued: HashSet<JobId> =
                    queued.iter().map(|j| j.job_id.clone()).collect();
                dispatched.retain(|id| still_queued.contains(id));

                let mut made_progress = false;
                for job in queued {
                    if dispatched.contains(&job.job_id) {
                        continue;
                    }
                    let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        // Saturated: stop here rather than skip ahead, so an
                        // earlier-queued job gets the next freed permit first.
                        Err(_) => break,
                    };
                    dispatched.insert(job.job_id.clone());
                    made_progress = true;
                    let pool = Arc::clone(&self);
                    let job_id = job.job_id;
                    tokio::spawn(async move {
                        pool.run(job_id).await;
                        drop(permit);
                        pool.dispatch_signal.notify_one();
                    });
                }

                if !made_progress {
                    self.dispatch_signal.notified().await;
                }
            }
        })
    }

    async fn run(&self, job_id: JobId) {
        let token = self.cancellation.register(job_id.clone()).await;

        if token.is_cancelled() {
            let _ = self
                .store
                .update(&job_id, |job| job.transition(JobStatus::Cancelled))
                .await;
            self.cancellation.unregister(&job_id).await;
            return;
        }

        let job = match self.store.get(&job_id).await {
            Some(job) => job,
            None => {
                self.cancellation.unregister(&job_id).await;
                return;
            }
        };

        let claimed = self
            .store
            .update(&job_id, |job| job.transition(JobStatus::Processing))
            .await;
        if claimed.is_err() {
            self.cancellation.unregister(&job_id).await;
            return;
        }

        let outcome = self.execute(&job_id, &job.parameters, &job.source, &token).await;

        match outcome {
            Ok((artifact, _note)) => {
                if let Err(e) = self.persist_success(&job_id, artifact).await {
                    error!(job_id = %job_id, error = %e, "failed to persist completed artifact");
                }
            }
            Err(e) if e.kind == ErrorKind::Cancelled => {
                let _ = self
                    .store
                    .update(&job_id, |job| job.transition(JobStatus::Cancelled))
                    .await;
            }
            Err(e) => {
                let _ = self
                    .store
                    .update(&job_id, |job| {
                        job.error = Some(e.clone());
                        job.transition(JobStatus::Failed)
                    })
                    .await;
            }
        }

        self.cancellation.unregister(&job_id).await;
    }

    async fn execute(
        &self,
        job_id: &JobId,
        params: &JobParameters,
        source: &crate::job::AudioSource,
        token: &crate::cancel::CancellationToken,
    ) -> Result<(TranscriptionArtifact, Option<String>)> {
        if token.is_cancelled() {
            return Err(OrchestratorError::cancelled("cancelled before work began"));
        }

        let sink = StoreProgressSink {
            store: Arc::clone(&self.store),
            job_id: job_id.clone(),
            stage_message: "transcribing",
        };
        let raw = self
            .transcription
            .transcribe(source, params, token, &sink)
            .await?;

        if token.is_cancelled() {
            return Err(OrchestratorError::cancelled("cancelled after transcription"));
        }

        let (turns, diarization_note) = if params.enable_diarization {
            match self.diarization.diarize(source, token).await {
                Ok(turns) => (turns, None),
                Err(e) if is_diarization_unavailable(&e) => {
                    info!(job_id = %job_id, "diarization unavailable, completing transcription-only");
                    (Vec::new(), Some(e.message))
                }
                Err(e) => return Err(e),
            }
        } else {
            (Vec::new(), None)
        };

        self.store
            .update(job_id, |job| {
                job.set_progress(85, "diarization complete");
                Ok(())
            })
            .await?;

        let (segments, speakers) = merge_segments(raw.segments, &turns);

        self.store
            .update(job_id, |job| {
                job.set_progress(95, "formatting");
                Ok(())
            })
            .await?;

        let realtime_factor = if raw.processing_seconds > 0.0 {
            raw.audio_seconds / raw.processing_seconds
        } else {
            0.0
        };

        let artifact = TranscriptionArtifact {
            text: raw.text,
            language: raw.language,
            segments,
            speakers,
            metadata: ArtifactMetadata {
                model: raw.model,
                device: raw.device,
                processing_seconds: raw.processing_seconds,
                audio_seconds: raw.audio_seconds,
                realtime_factor,
                diarization_note: diarization_note.clone(),
            },
        };

        Ok((artifact, diarization_note))
    }

    async fn persist_success(&self, job_id: &JobId, artifact: TranscriptionArtifact) -> Result<()> {
        let result_ref = format!("{job_id}/result.json");
        let artifact_dir = self.artifacts_root.join(job_id.as_str());
        tokio::fs::create_dir_all(&artifact_dir)
            .await
            .map_err(|e| OrchestratorError::server(format!("create artifact dir: {e}")))?;
        let contents = serde_json::to_vec_pretty(&artifact)
            .map_err(|e| OrchestratorError::server(format!("serialize artifact: {e}")))?;
        tokio::fs::write(artifact_dir.join("result.json"), contents)
            .await
            .map_err(|e| OrchestratorError::server(format!("write artifact: {e}")))?;

        self.store
            .update(job_id, |job| {
                job.result_ref = Some(result_ref.clone());
                job.transition(JobStatus::Completed)
            })
            .await?;
        Ok(())
    }

    pub fn broker(&self) -> &Arc<ProgressBroker> {
        &self.broker
    }

    /// Signal cancellation for an in-flight job. Returns `NotCancellable` if
    /// no worker currently holds a token for it.
    pub async fn cancel_job(&self, job_id: &JobId) -> crate::cancel::CancelOutcome {
        self.cancellation.cancel(job_id).await
    }
}
