//! Service facade: wires the job store, progress broker, worker pool, batch
//! coordinator, cancellation registry, and retention sweeper into the single
//! entry point a surface adapter (agent-tool host, HTTP layer, CLI) calls
//! into, rather than exposing the job store directly to the command layer.

use std::path::Path;
use std::sync::Arc;

use crate::batch::{BatchCoordinator, BatchSubmission};
use crate::broker::ProgressStream;
use crate::cancel::{CancelOutcome, CancellationRegistry};
use crate::config::Config;
use crate::engine::{
    DiarizationEngine, LocalDiarizationEngine, MockEngines, SubprocessEngineConfig,
    SubprocessTranscriptionEngine, TranscriptionEngine, audio_extension_supported,
};
use crate::error::{OrchestratorError, Result};
use crate::job::{AudioSource, BatchAggregate, Job, JobId, JobParameters};
use crate::jobstore::{JobFilter, JobStore};
use crate::retention::RetentionSweeper;
use crate::worker::WorkerPool;

/// How the transcription engine is backed. `Mock` exists for local
/// demonstration and the test suite; production wiring is `Subprocess`.
pub enum EngineBackend {
    Subprocess { binary_path: std::path::PathBuf },
    Mock,
}

/// Long-running orchestration core. One instance per process; cheap to
/// clone (every field is an `Arc`).
#[derive(Clone)]
pub struct Service {
    config: Arc<Config>,
    store: Arc<JobStore>,
    pool: Arc<WorkerPool>,
    batches: Arc<BatchCoordinator>,
    sweeper: Arc<RetentionSweeper>,
}

impl Service {
    /// Build every component from `config` and rehydrate the job store from
    /// disk. Does not start the retention sweep loop; call [`Self::spawn_retention_sweeper`]
    /// for that once the caller's runtime is ready.
    pub async fn start(config: Config, backend: EngineBackend) -> Result<Self> {
        tokio::fs::create_dir_all(config.jobs_dir())
            .await
            .map_err(|e| OrchestratorError::server(format!("create jobs dir: {e}")))?;
        tokio::fs::create_dir_all(config.artifacts_dir())
            .await
            .map_err(|e| OrchestratorError::server(format!("create artifacts dir: {e}")))?;

        let broker = Arc::new(crate::broker::ProgressBroker::new());
        let store = Arc::new(JobStore::open(config.jobs_dir(), Arc::clone(&broker)).await?);
        let cancellation = Arc::new(CancellationRegistry::new());

        let transcription: Arc<dyn TranscriptionEngine> = match &backend {
            EngineBackend::Subprocess { binary_path } => {
                Arc::new(SubprocessTranscriptionEngine::new(SubprocessEngineConfig {
                    binary_path: binary_path.clone(),
                    work_dir: config.work_dir.clone(),
                    timeout: config.max_processing_time(),
                    kill_grace: std::time::Duration::from_secs(10),
                    gpu_batch_size: 16,
                    gpu_available: config.use_gpu,
                }))
            }
            EngineBackend::Mock => Arc::new(MockEngines::default()),
        };
        let diarization: Arc<dyn DiarizationEngine> = match &backend {
            EngineBackend::Subprocess { .. } => Arc::new(LocalDiarizationEngine::new(
                config.hf_token.clone(),
                config.use_gpu,
            )),
            EngineBackend::Mock => Arc::new(MockEngines::default()),
        };

        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            cancellation,
            transcription,
            diarization,
            config.worker_concurrency,
            config.artifacts_dir(),
        ));
        Arc::clone(&pool).spawn_dispatcher();
        let batches = Arc::new(BatchCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            config.max_file_size,
        ));
        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::clone(&store),
            broker,
            config.artifacts_dir(),
            config.retain_horizon(),
            std::time::Duration::from_secs(600),
        ));

        Ok(Service {
            config: Arc::new(config),
            store,
            pool,
            batches,
            sweeper,
        })
    }

    pub fn spawn_retention_sweeper(&self) -> tokio::task::JoinHandle<()> {
        Arc::clone(&self.sweeper).spawn()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Submit a single-file transcription job, queue it, and return its id.
    pub async fn submit_single(&self, file_path: &str, parameters: JobParameters) -> Result<JobId> {
        let path = Path::new(file_path);
        if !path.exists() {
            return Err(OrchestratorError::file_not_found(format!(
                "file not found: {file_path}"
            )));
        }
        if !audio_extension_supported(path) {
            return Err(OrchestratorError::unsupported_format(format!(
                "unsupported audio format: {file_path}"
            )));
        }
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| OrchestratorError::invalid_file(format!("cannot stat {file_path}: {e}")))?;
        if metadata.len() > self.config.max_file_size {
            return Err(OrchestratorError::file_too_large(format!(
                "{file_path} is {} bytes, exceeding the {} byte limit",
                metadata.len(),
                self.config.max_file_size
            )));
        }

        let job = Job::new_single(
            JobId::new(),
            AudioSource {
                path: file_path.to_string(),
                original_filename: path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(file_path)
                    .to_string(),
            },
            parameters,
        );
        let job_id = job.job_id.clone();
        self.store.create(job).await?;
        self.pool.submit(job_id.clone()).await;
        Ok(job_id)
    }

    pub async fn submit_batch(
        &self,
        file_paths: Vec<String>,
        parameters: JobParameters,
        max_concurrent: u32,
    ) -> Result<BatchSubmission> {
        self.batches.submit(file_paths, parameters, max_concurrent).await
    }

    pub async fn get_job(&self, job_id: &JobId) -> Option<Job> {
        self.store.get(job_id).await
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Vec<Job> {
        self.store.list(filter).await
    }

    pub async fn batch_aggregate(&self, member_job_ids: &[JobId], batch_id: &str) -> BatchAggregate {
        self.batches.aggregate(member_job_ids, batch_id).await
    }

    pub async fn cancel_job(&self, job_id: &JobId) -> CancelOutcome {
        self.pool.cancel_job(job_id).await
    }

    /// Load the persisted artifact for a completed job. Callers are expected
    /// to check `Job::status == Completed` first; this only reads the file
    /// [`crate::worker::WorkerPool`] wrote at `result_ref`.
    pub async fn load_artifact(
        &self,
        job_id: &JobId,
    ) -> Result<crate::job::TranscriptionArtifact> {
        let path = self.config.artifacts_dir().join(job_id.as_str()).join("result.json");
        let contents = tokio::fs::read(&path)
            .await
            .map_err(|e| OrchestratorError::result_not_found(format!("artifact for job {job_id}: {e}")))?;
        serde_json::from_slice(&contents)
            .map_err(|e| OrchestratorError::server(format!("parse artifact for job {job_id}: {e}")))
    }

    /// Subscribe to progress for a single job. The stream yields a snapshot
    /// of the current state first, then live updates, closing after the
    /// terminal event.
    pub fn subscribe_progress(&self, job_id: &JobId) -> ProgressStream {
        self.pool.broker().subscribe(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh_service() -> (Service, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.work_dir = dir.path().to_path_buf();
        let service = Service::start(config, EngineBackend::Mock).await.unwrap();
        (service, dir)
    }

    #[tokio::test]
    async fn submit_single_rejects_missing_file() {
        let (service, _dir) = fresh_service().await;
        let err = service
            .submit_single("does-not-exist.wav", JobParameters::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
        assert_eq!(err.code, "FILE_NOT_FOUND");
    }

    async fn service_with_max_file_size(max_file_size: u64) -> (Service, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.work_dir = dir.path().to_path_buf();
        config.max_file_size = max_file_size;
        let service = Service::start(config, EngineBackend::Mock).await.unwrap();
        (service, dir)
    }

    #[tokio::test]
    async fn submit_single_accepts_file_at_exactly_max_size() {
        let (service, dir) = service_with_max_file_size(16).await;
        let clip = dir.path().join("clip.wav");
        tokio::fs::write(&clip, vec![0u8; 16]).await.unwrap();

        let result = service
            .submit_single(clip.to_str().unwrap(), JobParameters::default())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn submit_single_rejects_file_over_max_size() {
        let (service, dir) = service_with_max_file_size(16).await;
        let clip = dir.path().join("clip.wav");
        tokio::fs::write(&clip, vec![0u8; 17]).await.unwrap();

        let err = service
            .submit_single(clip.to_str().unwrap(), JobParameters::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, "FILE_TOO_LARGE");
    }

    #[tokio::test]
    async fn submit_single_runs_to_completion_with_mock_engine() {
        let (service, dir) = fresh_service().await;
        let clip = dir.path().join("clip.wav");
        tokio::fs::write(&clip, b"fake audio").await.unwrap();

        let job_id = service
            .submit_single(clip.to_str().unwrap(), JobParameters::default())
            .await
            .unwrap();

        for _ in 0..200 {
            if let Some(job) = service.get_job(&job_id).await {
                if job.status.is_terminal() {
                    assert_eq!(job.status, crate::job::JobStatus::Completed);
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn cancel_unknown_job_reports_not_cancellable() {
        let (service, _dir) = fresh_service().await;
        let outcome = service.cancel_job(&JobId::new()).await;
        assert_eq!(outcome, CancelOutcome::NotCancellable);
    }
}
